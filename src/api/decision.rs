//! Authorization decision types.

use crate::core::RuleId;
use crate::policy::Effect;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    /// The matched rule's effect is allow
    RuleAllow,
    /// The matched rule's effect is deny
    RuleDeny,
    /// The matched rule requires a token and none was supplied
    NoToken,
    /// The token is malformed, badly signed or expired
    InvalidToken,
    /// The token is valid but its claims are not accepted
    ClaimsDenied,
    /// The matched rule's predicate does not hold
    PredicateDenied,
    /// No rule matched
    DefaultDeny,
    /// The request path or method is malformed
    InvalidRequest,
}

impl Reason {
    /// Stable reason code, used in responses, logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::RuleAllow => "rule-allow",
            Reason::RuleDeny => "rule-deny",
            Reason::NoToken => "no-token",
            Reason::InvalidToken => "invalid-token",
            Reason::ClaimsDenied => "claims-denied",
            Reason::PredicateDenied => "predicate-denied",
            Reason::DefaultDeny => "default-deny",
            Reason::InvalidRequest => "invalid-request",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of authorizing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Allow or deny
    pub effect: Effect,
    /// Rule that produced the decision, if any matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<RuleId>,
    /// Reason code
    pub reason: Reason,
}

impl Decision {
    /// Decision taken by a matched rule.
    pub fn from_rule(rule_id: RuleId, effect: Effect) -> Self {
        let reason = match effect {
            Effect::Allow => Reason::RuleAllow,
            Effect::Deny => Reason::RuleDeny,
        };
        Self {
            effect,
            matched_rule: Some(rule_id),
            reason,
        }
    }

    /// Deny attributed to a matched rule whose precondition failed.
    pub fn deny_by(rule_id: RuleId, reason: Reason) -> Self {
        Self {
            effect: Effect::Deny,
            matched_rule: Some(rule_id),
            reason,
        }
    }

    /// Nothing matched.
    pub fn default_deny() -> Self {
        Self {
            effect: Effect::Deny,
            matched_rule: None,
            reason: Reason::DefaultDeny,
        }
    }

    /// The request could not be interpreted.
    pub fn invalid_request() -> Self {
        Self {
            effect: Effect::Deny,
            matched_rule: None,
            reason: Reason::InvalidRequest,
        }
    }

    /// Whether the request is allowed.
    pub fn is_allowed(&self) -> bool {
        self.effect.is_allowed()
    }
}
