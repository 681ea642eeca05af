//! Path templates and the segment trie.

use super::{Candidate, MatchResult, MatchTarget};
use crate::core::RuleId;
use crate::{Error, Result};

use std::collections::HashMap;
use std::fmt;

/// One segment of a path template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Matches exactly this text
    Literal(String),
    /// `{name}`: matches any single segment
    Param(String),
    /// `prefix{name}suffix`: a placeholder embedded in literal text
    Affixed {
        /// Literal text before the placeholder
        prefix: String,
        /// Placeholder name
        name: String,
        /// Literal text after the placeholder
        suffix: String,
    },
}

impl Segment {
    fn param_name(&self) -> Option<&str> {
        match self {
            Segment::Literal(_) => None,
            Segment::Param(name) | Segment::Affixed { name, .. } => Some(name),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Param(name) => write!(f, "{{{}}}", name),
            Segment::Affixed {
                prefix,
                name,
                suffix,
            } => write!(f, "{}{{{}}}{}", prefix, name, suffix),
        }
    }
}

/// Parse a path template such as `/jwt_{n}/{m}`.
///
/// A segment holds at most one placeholder; literal text may surround it.
/// `/` alone is the root template and has no segments.
pub fn parse_template(template: &str) -> Result<Vec<Segment>> {
    if template.is_empty() {
        return Err(Error::compile("empty path template"));
    }
    if !template.starts_with('/') {
        return Err(Error::compile(format!(
            "path template `{}` must start with `/`",
            template
        )));
    }
    if template == "/" {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for raw in template[1..].split('/') {
        if raw.is_empty() {
            return Err(Error::compile(format!(
                "path template `{}` contains an empty segment",
                template
            )));
        }

        if raw.contains(['{', '}']) {
            segments.push(parse_placeholder(raw, template)?);
        } else if raw == "." || raw == ".." || raw.chars().any(|c| c.is_whitespace()) {
            return Err(Error::compile(format!(
                "invalid segment `{}` in `{}`",
                raw, template
            )));
        } else {
            segments.push(Segment::Literal(raw.to_string()));
        }
    }

    Ok(segments)
}

fn parse_placeholder(raw: &str, template: &str) -> Result<Segment> {
    let invalid = || {
        Error::compile(format!(
            "invalid placeholder segment `{}` in `{}`",
            raw, template
        ))
    };
    let open = raw.find('{').ok_or_else(invalid)?;
    let close = raw.find('}').ok_or_else(invalid)?;
    if close < open {
        return Err(invalid());
    }

    let (prefix, rest) = raw.split_at(open);
    let name = &rest[1..close - open];
    let suffix = &raw[close + 1..];
    if !is_param_name(name) || suffix.contains(['{', '}']) || prefix.contains('}') {
        return Err(invalid());
    }

    if prefix.is_empty() && suffix.is_empty() {
        Ok(Segment::Param(name.to_string()))
    } else {
        Ok(Segment::Affixed {
            prefix: prefix.to_string(),
            name: name.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Names of every placeholder, in order.
pub fn param_names(segments: &[Segment]) -> impl Iterator<Item = &str> {
    segments.iter().filter_map(Segment::param_name)
}

/// Template shape with placeholder names erased, used to detect duplicates.
pub fn template_shape(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut shape = String::new();
    for segment in segments {
        shape.push('/');
        match segment {
            Segment::Literal(s) => shape.push_str(s),
            Segment::Param(_) => shape.push_str("{}"),
            Segment::Affixed { prefix, suffix, .. } => {
                shape.push_str(prefix);
                shape.push_str("{}");
                shape.push_str(suffix);
            }
        }
    }
    shape
}

#[derive(Debug, Default)]
struct TrieNode {
    literals: HashMap<String, usize>,
    param: Option<usize>,
    affixed: Vec<(String, String, usize)>,
    terminals: Vec<Candidate>,
}

fn affix_matches(segment: &str, prefix: &str, suffix: &str) -> bool {
    segment.len() > prefix.len() + suffix.len()
        && segment.starts_with(prefix)
        && segment.ends_with(suffix)
}

/// Segment-indexed trie of path templates.
///
/// A nested rule's template extends its parent's, so the child's terminal
/// node always sits below the parent's node.
#[derive(Debug)]
pub struct PathTrie {
    nodes: Vec<TrieNode>,
    rules: usize,
}

impl Default for PathTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTrie {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            rules: 0,
        }
    }

    /// Index a rule under a template.
    pub fn insert(&mut self, segments: &[Segment], candidate: Candidate) {
        let mut idx = 0;
        for segment in segments {
            let node = &self.nodes[idx];
            let existing = match segment {
                Segment::Literal(text) => node.literals.get(text.as_str()).copied(),
                Segment::Param(_) => node.param,
                Segment::Affixed { prefix, suffix, .. } => node
                    .affixed
                    .iter()
                    .find(|(p, s, _)| p == prefix && s == suffix)
                    .map(|(_, _, next)| *next),
            };
            idx = match existing {
                Some(next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    let node = &mut self.nodes[idx];
                    match segment {
                        Segment::Literal(text) => {
                            node.literals.insert(text.clone(), next);
                        }
                        Segment::Param(_) => node.param = Some(next),
                        Segment::Affixed { prefix, suffix, .. } => {
                            node.affixed.push((prefix.clone(), suffix.clone(), next));
                        }
                    }
                    next
                }
            };
        }
        self.nodes[idx].terminals.push(candidate);
        self.rules += 1;
    }

    /// Find the most specific rule whose template matches all segments.
    pub fn lookup(&self, segments: &[&str], method: &str) -> Option<MatchResult> {
        let mut best = None;
        self.walk(0, segments, method, &mut best);
        best
    }

    fn walk(&self, idx: usize, rest: &[&str], method: &str, best: &mut Option<MatchResult>) {
        let node = &self.nodes[idx];
        match rest.split_first() {
            None => {
                for candidate in &node.terminals {
                    if candidate.methods.allows(method) {
                        MatchResult::keep_best(best, candidate.result());
                    }
                }
            }
            Some((head, tail)) => {
                if let Some(&next) = node.literals.get(*head) {
                    self.walk(next, tail, method, best);
                }
                for (prefix, suffix, next) in &node.affixed {
                    if affix_matches(head, prefix, suffix) {
                        self.walk(*next, tail, method, best);
                    }
                }
                if let Some(next) = node.param {
                    self.walk(next, tail, method, best);
                }
            }
        }
    }

    /// The earliest indexed rule that outranks `candidate` on every request
    /// its template can match. Such a rule makes the candidate unreachable.
    pub fn shadowing(&self, segments: &[Segment], candidate: &Candidate) -> Option<RuleId> {
        let mut found = None;
        self.cover(0, segments, candidate, &mut found);
        found
    }

    fn cover(&self, idx: usize, rest: &[Segment], candidate: &Candidate, found: &mut Option<RuleId>) {
        let node = &self.nodes[idx];
        let Some((head, tail)) = rest.split_first() else {
            for existing in &node.terminals {
                // Rules are indexed in id order, so any existing rule wins a depth tie.
                if existing.depth >= candidate.depth && existing.methods.covers(&candidate.methods) {
                    *found = Some(found.map_or(existing.rule_id, |f| f.min(existing.rule_id)));
                }
            }
            return;
        };

        if let Some(next) = node.param {
            self.cover(next, tail, candidate, found);
        }
        match head {
            Segment::Literal(text) => {
                if let Some(&next) = node.literals.get(text.as_str()) {
                    self.cover(next, tail, candidate, found);
                }
                for (prefix, suffix, next) in &node.affixed {
                    if affix_matches(text, prefix, suffix) {
                        self.cover(*next, tail, candidate, found);
                    }
                }
            }
            Segment::Affixed { prefix, suffix, .. } => {
                for (p, s, next) in &node.affixed {
                    if prefix.starts_with(p.as_str()) && suffix.ends_with(s.as_str()) {
                        self.cover(*next, tail, candidate, found);
                    }
                }
            }
            Segment::Param(_) => {}
        }
    }

    /// Number of indexed rules.
    pub fn len(&self) -> usize {
        self.rules
    }

    /// Whether the trie indexes no rules.
    pub fn is_empty(&self) -> bool {
        self.rules == 0
    }
}

/// Matcher for `json` rules.
#[derive(Debug, Default)]
pub struct PathMatcher {
    trie: PathTrie,
}

impl PathMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a rule, refusing one that an earlier rule would always outrank.
    pub fn insert(&mut self, segments: &[Segment], candidate: Candidate) -> Result<()> {
        insert_reachable(&mut self.trie, segments, candidate)
    }

    /// Locate the winning rule.
    pub fn matches(&self, target: &MatchTarget<'_>) -> Option<MatchResult> {
        self.trie.lookup(&target.segments, target.method)
    }

    /// Number of indexed rules.
    pub fn len(&self) -> usize {
        self.trie.len()
    }

    /// Whether the matcher indexes no rules.
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

pub(crate) fn insert_reachable(
    trie: &mut PathTrie,
    segments: &[Segment],
    candidate: Candidate,
) -> Result<()> {
    if let Some(winner) = trie.shadowing(segments, &candidate) {
        return Err(Error::compile(format!(
            "rule is unreachable: rule {} wins every request it matches",
            winner
        )));
    }
    trie.insert(segments, candidate);
    Ok(())
}
