//! Policy compilation and request evaluation.

mod compiler;
mod evaluator;
mod policy_set;

pub use compiler::{compile, compile_rules, MAX_DEPTH};
pub use evaluator::decide;
pub use policy_set::{CompiledRule, PolicySet, RuleId};
