//! The compiled, immutable rule set.

use crate::api::{Decision, RequestDescriptor};
use crate::matcher::{MatchResult, MatchTarget, Matcher, MethodSet, Predicate, TokenRequirement};
use crate::policy::{Effect, RuleKind};

use std::sync::Arc;

/// Dense rule identifier, assigned in declaration order (parents before children).
pub type RuleId = u32;

/// A rule after inheritance has been resolved.
#[derive(Debug)]
pub struct CompiledRule {
    /// Rule id
    pub id: RuleId,
    /// Declared name, if any
    pub name: Option<String>,
    /// Rule kind
    pub kind: RuleKind,
    /// Effective pattern, including every ancestor's contribution
    pub pattern: String,
    /// Effect applied when the rule wins and its preconditions hold
    pub effect: Effect,
    /// Methods the rule applies to
    pub methods: MethodSet,
    /// Nesting depth (top-level = 1)
    pub depth: u16,
    /// Enclosing rule
    pub parent: Option<RuleId>,
    /// Directly nested rules
    pub children: Vec<RuleId>,
    /// Token precondition; shared with children that inherit it
    pub token: Option<Arc<TokenRequirement>>,
    /// Predicate precondition; shared with children that inherit it
    pub predicate: Option<Arc<Predicate>>,
}

impl CompiledRule {
    /// Name for logs: the declared name, or `<kind>:<pattern>`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.kind, self.pattern),
        }
    }
}

/// Immutable compiled policy: a rule arena plus one matcher per kind.
///
/// Safe to share across threads; a decision never mutates it.
#[derive(Debug)]
pub struct PolicySet {
    name: Option<String>,
    rules: Vec<CompiledRule>,
    matchers: Vec<Matcher>,
}

impl PolicySet {
    pub(crate) fn new(name: Option<String>, rules: Vec<CompiledRule>, matchers: Vec<Matcher>) -> Self {
        Self {
            name,
            rules,
            matchers,
        }
    }

    /// A set with no rules; every request is denied.
    pub fn empty() -> Self {
        Self::new(None, Vec::new(), Vec::new())
    }

    /// Document name, if the source document had one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Look up a rule.
    pub fn rule(&self, id: RuleId) -> Option<&CompiledRule> {
        self.rules.get(id as usize)
    }

    /// All rules in id order.
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Matchers in dispatch order.
    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules of a kind.
    pub fn count(&self, kind: RuleKind) -> usize {
        self.rules.iter().filter(|r| r.kind == kind).count()
    }

    /// Locate the winning rule: the first matcher (in dispatch order) with a
    /// match decides.
    pub fn locate(&self, target: &MatchTarget<'_>) -> Option<MatchResult> {
        self.matchers
            .iter()
            .filter(|m| !m.is_empty())
            .find_map(|m| m.matches(target))
    }

    /// Decide a request against this set.
    pub fn decide(&self, desc: &RequestDescriptor) -> Decision {
        super::evaluator::decide(desc, self)
    }
}
