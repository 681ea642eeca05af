//! Request descriptor definitions.
//!
//! A [`RequestDescriptor`] is the only input to a decision. The gateway
//! builds one per inbound check from the configured headers.

use crate::matcher::MatchTarget;
use serde::{Deserialize, Serialize};

/// Everything the engine knows about a request being authorized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Caller identity (`x-source`), if supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Request path being authorized (`x-path`)
    pub path: String,
    /// HTTP method being authorized (`x-method`), upper-case
    pub method: String,
    /// Raw bearer token; never serialized
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl RequestDescriptor {
    /// Create a descriptor for a path and method.
    pub fn new(path: impl Into<String>, method: impl AsRef<str>) -> Self {
        Self {
            source: None,
            path: path.into(),
            method: method.as_ref().to_ascii_uppercase(),
            token: None,
        }
    }

    /// Create a descriptor builder.
    pub fn builder() -> RequestDescriptorBuilder {
        RequestDescriptorBuilder::new()
    }

    /// Parse the path and method for matching; `None` if either is malformed.
    pub fn target(&self) -> Option<MatchTarget<'_>> {
        MatchTarget::parse(&self.path, &self.method)
    }

    /// Whether the request carries a non-empty token.
    pub fn has_token(&self) -> bool {
        self.token.as_deref().map_or(false, |t| !t.trim().is_empty())
    }
}

/// Builder for [`RequestDescriptor`].
#[derive(Debug, Default)]
pub struct RequestDescriptorBuilder {
    descriptor: RequestDescriptor,
}

impl RequestDescriptorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the caller identity.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.descriptor.source = Some(source.into());
        self
    }

    /// Set the path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.descriptor.path = path.into();
        self
    }

    /// Set the method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.descriptor.method = method.into();
        self
    }

    /// Set the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.descriptor.token = Some(token.into());
        self
    }

    /// Build the descriptor.
    pub fn build(mut self) -> RequestDescriptor {
        self.descriptor.method.make_ascii_uppercase();
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let desc = RequestDescriptor::builder()
            .with_source("client1")
            .with_path("/json_1/1")
            .with_method("get")
            .build();

        assert_eq!(desc.method, "GET");
        assert_eq!(desc.source.as_deref(), Some("client1"));
        assert!(!desc.has_token());
        assert_eq!(desc.target().unwrap().segments, vec!["json_1", "1"]);
    }

    #[test]
    fn test_token_never_serialized() {
        let desc = RequestDescriptor::builder()
            .with_path("/jwt_1/1")
            .with_method("GET")
            .with_token("a.b.c")
            .build();

        let json = serde_json::to_string(&desc).unwrap();
        assert!(!json.contains("a.b.c"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_malformed_target() {
        assert!(RequestDescriptor::new("relative", "GET").target().is_none());
        assert!(RequestDescriptor::new("/a", "").target().is_none());
    }
}
