//! Regular-expression matcher.
//!
//! A nested regex rule is the concatenation of every pattern piece on the
//! path from its top-level ancestor, anchored at both ends. Each node also
//! keeps a start-anchored prefix expression so that a subtree is skipped
//! as soon as its shared prefix cannot match.

use super::{Candidate, MatchResult, MatchTarget};
use crate::{Error, Result};

use ::regex::Regex;

#[derive(Debug)]
struct RegexNode {
    candidate: Candidate,
    full: Regex,
    prefix: Regex,
    children: Vec<usize>,
}

/// Matcher for `regex` rules.
#[derive(Debug, Default)]
pub struct RegexMatcher {
    nodes: Vec<RegexNode>,
    roots: Vec<usize>,
}

/// Strip the marker and anchors a pattern piece may carry.
///
/// Accepts `~/regex_8`, `^/regex_8$` and `/regex_8` alike.
pub fn normalize_piece(raw: &str) -> Result<String> {
    let mut piece = raw.trim();
    piece = piece.strip_prefix('~').unwrap_or(piece);
    piece = piece.strip_prefix('^').unwrap_or(piece);
    if piece.ends_with('$') && !is_escaped(piece, piece.len() - 1) {
        piece = &piece[..piece.len() - 1];
    }
    if piece.is_empty() {
        return Err(Error::compile(format!("empty regular expression `{}`", raw)));
    }

    // A piece must stand on its own so that grouping cannot leak between levels.
    Regex::new(piece)
        .map_err(|e| Error::compile(format!("invalid regular expression `{}`: {}", raw, e)))?;
    Ok(piece.to_string())
}

fn is_escaped(s: &str, idx: usize) -> bool {
    s.as_bytes()[..idx]
        .iter()
        .rev()
        .take_while(|b| **b == b'\\')
        .count()
        % 2
        == 1
}

fn joined(pieces: &[String]) -> String {
    pieces.iter().map(|p| format!("(?:{})", p)).collect()
}

impl RegexMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule whose normalized pieces run from the top-level ancestor down
    /// to the rule itself. Returns the node handle to pass for its children.
    pub fn add(
        &mut self,
        parent: Option<usize>,
        pieces: &[String],
        candidate: Candidate,
    ) -> Result<usize> {
        let body = joined(pieces);
        let full = Regex::new(&format!("^{}$", body))
            .map_err(|e| Error::compile(format!("invalid regular expression: {}", e)))?;
        let prefix = Regex::new(&format!("^{}", body))
            .map_err(|e| Error::compile(format!("invalid regular expression: {}", e)))?;

        let idx = self.nodes.len();
        self.nodes.push(RegexNode {
            candidate,
            full,
            prefix,
            children: Vec::new(),
        });

        match parent {
            Some(p) if p < idx => self.nodes[p].children.push(idx),
            Some(p) => {
                return Err(Error::internal(format!("unknown regex parent node {}", p)));
            }
            None => self.roots.push(idx),
        }
        Ok(idx)
    }

    /// Locate the winning rule.
    pub fn matches(&self, target: &MatchTarget<'_>) -> Option<MatchResult> {
        let mut best = None;
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();

        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.prefix.is_match(target.path) {
                continue;
            }
            if node.candidate.methods.allows(target.method) && node.full.is_match(target.path) {
                MatchResult::keep_best(&mut best, node.candidate.result());
            }
            stack.extend(node.children.iter().rev());
        }

        best
    }

    /// Full anchored expression of a node.
    pub fn expression(&self, node: usize) -> Option<&str> {
        self.nodes.get(node).map(|n| n.full.as_str())
    }

    /// Number of indexed rules.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the matcher indexes no rules.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MethodSet;

    fn candidate(rule_id: u32, depth: u16) -> Candidate {
        Candidate {
            rule_id,
            depth,
            methods: MethodSet::Any,
        }
    }

    fn pieces(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|p| normalize_piece(p).unwrap()).collect()
    }

    #[test]
    fn test_normalize_piece() {
        assert_eq!(normalize_piece("~/regex_p/[0-9]+").unwrap(), "/regex_p/[0-9]+");
        assert_eq!(normalize_piece("^/a$").unwrap(), "/a");
        assert_eq!(normalize_piece(r"/cost\$").unwrap(), r"/cost\$");
        assert!(normalize_piece("~").is_err());
        assert!(normalize_piece("/a)|(b").is_err());
        assert!(normalize_piece("/[0-9").is_err());
    }

    #[test]
    fn test_full_match_is_anchored() {
        let mut m = RegexMatcher::new();
        m.add(None, &pieces(&["~/regex_1/[0-9]+/sub_1/[0-9]+"]), candidate(0, 1))
            .unwrap();

        let hit = MatchTarget::parse("/regex_1/12/sub_1/3", "GET").unwrap();
        assert_eq!(m.matches(&hit).unwrap().rule_id, 0);

        let longer = MatchTarget::parse("/regex_1/12/sub_1/3/x", "GET").unwrap();
        assert!(m.matches(&longer).is_none());
        let inside = MatchTarget::parse("/x/regex_1/12/sub_1/3", "GET").unwrap();
        assert!(m.matches(&inside).is_none());
    }

    #[test]
    fn test_nested_rule_extends_parent() {
        let mut m = RegexMatcher::new();
        let parent = m
            .add(None, &pieces(&["/regex_8(/.*)?"]), candidate(0, 1))
            .unwrap();
        m.add(
            Some(parent),
            &pieces(&["/regex_8", "/[0-9]+/sub_5/[0-9]+"]),
            candidate(1, 2),
        )
        .unwrap();
        assert_eq!(m.expression(1), Some("^(?:/regex_8)(?:/[0-9]+/sub_5/[0-9]+)$"));

        let child = MatchTarget::parse("/regex_8/1/sub_5/2", "GET").unwrap();
        assert_eq!(m.matches(&child).unwrap().rule_id, 1);

        let parent_only = MatchTarget::parse("/regex_8/1/other", "GET").unwrap();
        assert_eq!(m.matches(&parent_only).unwrap().rule_id, 0);

        let unrelated = MatchTarget::parse("/regex_9/1/sub_5/2", "GET").unwrap();
        assert!(m.matches(&unrelated).is_none());
    }

    #[test]
    fn test_method_filter() {
        let mut m = RegexMatcher::new();
        m.add(
            None,
            &pieces(&["/r/[a-z]+"]),
            Candidate {
                rule_id: 0,
                depth: 1,
                methods: MethodSet::Only(vec!["POST".to_string()]),
            },
        )
        .unwrap();
        assert!(m.matches(&MatchTarget::parse("/r/abc", "POST").unwrap()).is_some());
        assert!(m.matches(&MatchTarget::parse("/r/abc", "GET").unwrap()).is_none());
    }

    #[test]
    fn test_unknown_parent() {
        let mut m = RegexMatcher::new();
        assert!(m.add(Some(3), &pieces(&["/a"]), candidate(0, 2)).is_err());
    }
}
