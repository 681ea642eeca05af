//! Rule definitions as they appear in a policy document.

use super::{Effect, PredicateSpec};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The kind of a rule, which selects the matcher it is compiled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Path-template rule guarded by a bearer token
    Jwt,
    /// Regular-expression path rule
    Regex,
    /// Path-template rule with a structured-data predicate
    Json,
}

impl RuleKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Jwt => "jwt",
            RuleKind::Regex => "regex",
            RuleKind::Json => "json",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule as declared in a policy document.
///
/// Children inherit the parent's kind, methods, token settings and predicate
/// unless they declare their own; a child's pattern is appended to its
/// parent's pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Optional human-readable name, used in logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Rule kind; required on top-level rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RuleKind>,
    /// Path template (`/jwt_{n}/{m}`) or regular expression
    pub pattern: String,
    /// HTTP methods the rule applies to; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Effect applied when the rule wins; defaults to the parent's, then `allow`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    /// Make token validation a precondition of a path or regex rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_token: Option<bool>,
    /// Required token claims
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, ClaimValue>,
    /// Rule-level token verification settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSpec>,
    /// Structured-data predicate (json rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<PredicateSpec>,
    /// Nested sub-rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RuleSpec>,
}

impl RuleSpec {
    /// Create a rule of the given kind.
    pub fn new(kind: RuleKind, pattern: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    /// Create a child rule that inherits its kind from the parent.
    pub fn child(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    /// Set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the effect.
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Restrict the rule to a method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    /// Require a token for this rule.
    pub fn with_require_token(mut self, required: bool) -> Self {
        self.require_token = Some(required);
        self
    }

    /// Require a claim value.
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<ClaimValue>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    /// Set rule-level token settings.
    pub fn with_token(mut self, token: TokenSpec) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the predicate.
    pub fn with_predicate(mut self, predicate: PredicateSpec) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Add a child rule.
    pub fn with_child(mut self, child: RuleSpec) -> Self {
        self.children.push(child);
        self
    }
}

/// Accepted value(s) for a required claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    /// Any of the listed values is accepted
    AnyOf(Vec<serde_json::Value>),
    /// Exactly this value is accepted
    One(serde_json::Value),
}

impl ClaimValue {
    /// Flatten into the list of accepted values.
    pub fn accepted(&self) -> Vec<serde_json::Value> {
        match self {
            ClaimValue::AnyOf(values) => values.clone(),
            ClaimValue::One(value) => vec![value.clone()],
        }
    }
}

impl From<&str> for ClaimValue {
    fn from(value: &str) -> Self {
        ClaimValue::One(serde_json::Value::String(value.to_string()))
    }
}

impl From<serde_json::Value> for ClaimValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(values) => ClaimValue::AnyOf(values),
            other => ClaimValue::One(other),
        }
    }
}

/// Token verification settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenSpec {
    /// Signature algorithm; defaults to HS256
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
    /// Inline key: shared secret for HS*, PEM for asymmetric algorithms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Key file, read at compile time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl TokenSpec {
    /// Shared-secret settings.
    pub fn secret(key: impl Into<String>) -> Self {
        Self {
            algorithm: None,
            key: Some(key.into()),
            key_file: None,
        }
    }

    /// Whether these settings name any key material.
    pub fn has_key(&self) -> bool {
        self.key.is_some() || self.key_file.is_some()
    }
}
