//! Predicate definitions for json rules.

use serde::{Deserialize, Serialize};

/// A path/value predicate evaluated against request metadata.
///
/// `field` is a dotted path into the request metadata document
/// (`source`, `path`, `method`, `token_present`, `claims.<name>`). Exactly
/// one test must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredicateSpec {
    /// Field path in the request metadata
    pub field: String,
    /// Field equals this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
    /// Field equals one of these values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<serde_json::Value>>,
    /// Field is among the values selected from the policy data, e.g. `{.team1[*].name}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_data: Option<String>,
    /// Field presence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

impl PredicateSpec {
    /// Create an equality predicate.
    pub fn equals(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            equals: Some(value.into()),
            ..Self::default()
        }
    }

    /// Create a membership predicate.
    pub fn one_of(field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            one_of: Some(values),
            ..Self::default()
        }
    }

    /// Create a predicate over values selected from the policy data.
    pub fn in_data(field: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            in_data: Some(expression.into()),
            ..Self::default()
        }
    }

    /// Create a presence predicate.
    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Self {
            field: field.into(),
            exists: Some(present),
            ..Self::default()
        }
    }

    /// Number of tests set; a valid predicate has exactly one.
    pub fn test_count(&self) -> usize {
        [
            self.equals.is_some(),
            self.one_of.is_some(),
            self.in_data.is_some(),
            self.exists.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}
