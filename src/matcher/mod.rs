//! Request matchers.
//!
//! Each rule kind compiles into exactly one matcher variant:
//!
//! | kind    | matcher                  | structure                        |
//! |---------|--------------------------|----------------------------------|
//! | `json`  | [`Matcher::Path`]        | segment trie of path templates   |
//! | `regex` | [`Matcher::Regex`]       | tree of anchored regex groups    |
//! | `jwt`   | [`Matcher::Token`]       | segment trie + token requirement |
//!
//! A matcher only locates the winning rule of its kind. Token verification
//! and predicates run afterwards as preconditions of that rule, so that a
//! missing or bad token surfaces as its own deny reason instead of a silent
//! fall-through.

pub mod path;
pub mod predicate;
pub mod regex;
pub mod token;

pub use self::path::{parse_template, PathMatcher, PathTrie, Segment};
pub use self::predicate::Predicate;
pub use self::regex::RegexMatcher;
pub use self::token::{Claims, TokenMatcher, TokenRequirement, TokenVerdict};

use crate::core::RuleId;
use crate::policy::RuleKind;

/// Tie-break metric: nesting depth of the matched rule (top-level = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Specificity(pub u16);

/// A rule located by a matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    /// The matched rule
    pub rule_id: RuleId,
    /// How specific the match is
    pub specificity: Specificity,
}

impl MatchResult {
    /// Whether `self` wins over `other`: deeper first, then earlier-declared.
    pub fn outranks(&self, other: &MatchResult) -> bool {
        self.specificity > other.specificity
            || (self.specificity == other.specificity && self.rule_id < other.rule_id)
    }

    /// Keep the better of the current best and a new candidate.
    pub(crate) fn keep_best(best: &mut Option<MatchResult>, candidate: MatchResult) {
        match best {
            Some(current) if !candidate.outranks(current) => {}
            _ => *best = Some(candidate),
        }
    }
}

/// HTTP methods a compiled rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    /// Any method
    Any,
    /// Only these (upper-case) methods
    Only(Vec<String>),
}

impl MethodSet {
    /// Check whether a request method is covered.
    pub fn allows(&self, method: &str) -> bool {
        match self {
            MethodSet::Any => true,
            MethodSet::Only(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
        }
    }

    /// Whether every method `other` allows is allowed here too.
    pub fn covers(&self, other: &MethodSet) -> bool {
        match (self, other) {
            (MethodSet::Any, _) => true,
            (MethodSet::Only(_), MethodSet::Any) => false,
            (MethodSet::Only(mine), MethodSet::Only(theirs)) => {
                theirs.iter().all(|m| mine.contains(m))
            }
        }
    }

    /// Method labels for duplicate detection; `*` stands for any.
    pub fn labels(&self) -> Vec<&str> {
        match self {
            MethodSet::Any => vec!["*"],
            MethodSet::Only(methods) => methods.iter().map(String::as_str).collect(),
        }
    }
}

/// Matcher-side view of a compiled rule.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Rule id in the policy arena
    pub rule_id: RuleId,
    /// Nesting depth
    pub depth: u16,
    /// Methods the rule applies to
    pub methods: MethodSet,
}

impl Candidate {
    pub(crate) fn result(&self) -> MatchResult {
        MatchResult {
            rule_id: self.rule_id,
            specificity: Specificity(self.depth),
        }
    }
}

/// A parsed request target: normalized path, its segments and the method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchTarget<'a> {
    /// Normalized path (no query, no trailing slash)
    pub path: &'a str,
    /// Path segments
    pub segments: Vec<&'a str>,
    /// Request method
    pub method: &'a str,
}

impl<'a> MatchTarget<'a> {
    /// Parse a raw path and method; `None` means the request is malformed.
    pub fn parse(raw_path: &'a str, method: &'a str) -> Option<Self> {
        if method.is_empty() || method.len() > 16 || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return None;
        }

        let end = raw_path.find(|c: char| c == '?' || c == '#').unwrap_or(raw_path.len());
        let mut path = &raw_path[..end];
        if !path.starts_with('/') || path.contains("//") {
            return None;
        }
        if path.len() > 1 && path.ends_with('/') {
            path = &path[..path.len() - 1];
        }
        if path.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return None;
        }

        let segments: Vec<&str> = if path == "/" {
            Vec::new()
        } else {
            path[1..].split('/').collect()
        };
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return None;
        }

        Some(Self {
            path,
            segments,
            method,
        })
    }
}

/// The closed set of matcher strategies.
#[derive(Debug)]
pub enum Matcher {
    /// Hierarchical path-template matcher (`json` rules)
    Path(PathMatcher),
    /// Regular-expression matcher (`regex` rules)
    Regex(RegexMatcher),
    /// Token-guarded path-template matcher (`jwt` rules)
    Token(TokenMatcher),
}

impl Matcher {
    /// Locate the winning rule of this matcher's kind.
    pub fn matches(&self, target: &MatchTarget<'_>) -> Option<MatchResult> {
        match self {
            Matcher::Path(m) => m.matches(target),
            Matcher::Regex(m) => m.matches(target),
            Matcher::Token(m) => m.matches(target),
        }
    }

    /// The rule kind served by this matcher.
    pub fn kind(&self) -> RuleKind {
        match self {
            Matcher::Path(_) => RuleKind::Json,
            Matcher::Regex(_) => RuleKind::Regex,
            Matcher::Token(_) => RuleKind::Jwt,
        }
    }

    /// Number of rules indexed by this matcher.
    pub fn len(&self) -> usize {
        match self {
            Matcher::Path(m) => m.len(),
            Matcher::Regex(m) => m.len(),
            Matcher::Token(m) => m.len(),
        }
    }

    /// Whether the matcher indexes no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
