//! Policy document parsing.

use super::{RuleSpec, TokenSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Named value lists. A `one_of` entry or `in_data` expression of the form
/// `$name` expands to the list; each entry is a literal or a data selection.
pub type Vars = BTreeMap<String, Vec<String>>;

/// A policy document: token defaults, structured data and an ordered rule list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Optional document name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Token verification defaults for rules that require a token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSpec>,
    /// Structured data consulted by `in_data` predicates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Variables referenced by predicates as `$name`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: Vars,
    /// Rules in declaration order
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl PolicyDocument {
    /// Create an empty policy document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy document with the given rules.
    pub fn with_rules(rules: Vec<RuleSpec>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Set the token defaults.
    pub fn with_token(mut self, token: TokenSpec) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the structured data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Define a variable.
    pub fn with_var(mut self, name: impl Into<String>, entries: Vec<String>) -> Self {
        self.vars.insert(name.into(), entries);
        self
    }

    /// Append a rule.
    pub fn add_rule(&mut self, rule: RuleSpec) {
        self.rules.push(rule);
    }

    /// Parse a policy document from YAML.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        serde_yaml::from_str(yaml).map_err(crate::Error::from)
    }

    /// Parse a policy document from JSON.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(crate::Error::from)
    }

    /// Load a policy document from a file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match extension.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    /// Load structured data from a JSON (or YAML) file, replacing inline data.
    pub fn load_data_file(&mut self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let data = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(json_err) => serde_yaml::from_str(&content).map_err(|_| {
                crate::Error::parse(format!(
                    "data file {} is not valid JSON: {}",
                    path.display(),
                    json_err
                ))
            })?,
        };
        self.data = Some(data);
        Ok(())
    }

    /// Convert the document to YAML.
    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(crate::Error::from)
    }

    /// Convert the document to JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(crate::Error::from)
    }
}
