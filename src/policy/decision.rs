//! Rule effects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The effect a rule applies when it wins for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Allow the request to proceed
    Allow,
    /// Deny the request
    Deny,
}

impl Effect {
    /// Check if this effect allows the request.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Effect::Allow)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Effect {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            _ => Err(crate::Error::parse(format!("Unknown effect: {}", s))),
        }
    }
}
