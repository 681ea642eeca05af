//! # Authz Engine
//!
//! Low-latency authorization decisions for HTTP requests. A policy document
//! of nested path rules is compiled once into an immutable [`PolicySet`];
//! each request is then reduced to a [`RequestDescriptor`] and decided
//! against it without locks or I/O.
//!
//! ## Features
//!
//! - **Three rule kinds**: path templates with structured-data predicates
//!   (`json`), regular expressions (`regex`) and token-guarded path
//!   templates (`jwt`)
//! - **Nested rules**: children extend their parent's pattern and inherit
//!   its settings; the deepest match wins
//! - **Default deny**: anything unmatched, malformed or unverifiable is denied
//!   with a distinct reason code
//! - **Hot reload**: a new set is compiled off the hot path and swapped in
//!   atomically
//! - **HTTP gateway**: an axum listener for checks (optionally HTTPS) and a second one for
//!   Prometheus metrics and health
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authz_engine::{AuthzEngine, PolicyDocument, RequestDescriptor};
//!
//! fn main() -> authz_engine::Result<()> {
//!     let document = PolicyDocument::from_yaml(
//!         r#"
//! rules:
//!   - kind: regex
//!     pattern: "~/health/[a-z]+"
//! "#,
//!     )?;
//!
//!     let engine = AuthzEngine::builder().with_document(document).build()?;
//!
//!     let request = RequestDescriptor::builder()
//!         .with_path("/health/live")
//!         .with_method("GET")
//!         .with_source("uptime-monitor")
//!         .build();
//!
//!     let decision = engine.check(&request);
//!     println!("{} ({})", decision.effect, decision.reason);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod matcher;
pub mod policy;
pub mod server;
pub mod telemetry;

// Re-export main types for convenience
pub use api::{AuthzEngine, AuthzEngineBuilder, Decision, Reason, RequestDescriptor};
pub use config::Config;
pub use core::{compile, PolicySet, RuleId};
pub use error::{Error, Result};
pub use policy::{Effect, PolicyDocument, PredicateSpec, RuleKind, RuleSpec, TokenSpec};

/// Version of the authorization engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the authorization engine.
pub const NAME: &str = env!("CARGO_PKG_NAME");
