//! Public API for the authorization engine.
//!
//! This module provides the main interface: the [`AuthzEngine`], the
//! [`RequestDescriptor`] it decides on and the [`Decision`] it returns.

mod context;
mod decision;
mod engine;

pub use context::{RequestDescriptor, RequestDescriptorBuilder};
pub use decision::{Decision, Reason};
pub use engine::{ActivePolicy, AuthzEngine, AuthzEngineBuilder, PolicySummary, AUDIT_TARGET};
