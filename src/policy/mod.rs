//! Policy definition types.
//!
//! A [`PolicyDocument`] is the declarative input: an ordered list of
//! [`RuleSpec`]s grouped by [`RuleKind`], plus token defaults and structured
//! data. It is compiled into a [`PolicySet`](crate::core::PolicySet) before
//! any request is evaluated.

mod condition;
mod decision;
mod document;
mod rule;

pub use condition::PredicateSpec;
pub use decision::Effect;
pub use document::{PolicyDocument, Vars};
pub use rule::{ClaimValue, RuleKind, RuleSpec, TokenSpec};

/// HTTP methods a rule may be restricted to.
pub const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "PATCH", "DELETE", "TRACE", "HEAD", "CONNECT", "OPTIONS",
];
