//! Policy compiler: turns a [`PolicyDocument`] into a [`PolicySet`].
//!
//! Compilation resolves inheritance, validates every rule and builds the
//! per-kind matchers. Any problem aborts the whole compile; nothing is ever
//! partially applied.

use super::policy_set::{CompiledRule, PolicySet, RuleId};
use crate::error::ErrorContext;
use crate::matcher::path::{param_names, parse_template, template_shape, Segment};
use crate::matcher::predicate::{check_vars, Bindings};
use crate::matcher::regex::normalize_piece;
use crate::matcher::{
    Candidate, Matcher, MethodSet, PathMatcher, Predicate, RegexMatcher, TokenMatcher,
    TokenRequirement,
};
use crate::policy::{ClaimValue, Effect, PolicyDocument, RuleKind, RuleSpec, TokenSpec, HTTP_METHODS};
use crate::{Error, Result};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Deepest nesting accepted.
pub const MAX_DEPTH: u16 = 32;

/// Compile a policy document.
pub fn compile(document: &PolicyDocument) -> Result<PolicySet> {
    check_vars(&document.vars).at_rule("vars")?;
    let bindings = Bindings {
        data: document.data.as_ref(),
        vars: Some(&document.vars),
    };
    let mut compiler = Compiler::new(document.token.as_ref(), bindings);
    for (i, rule) in document.rules.iter().enumerate() {
        let location = format!("rules[{}]", i);
        compiler.rule(rule, None, &location).at_rule(location.as_str())?;
    }
    let set = compiler.finish(document.name.clone());

    tracing::debug!(
        rules = set.len(),
        json = set.count(RuleKind::Json),
        regex = set.count(RuleKind::Regex),
        jwt = set.count(RuleKind::Jwt),
        "compiled policy"
    );
    Ok(set)
}

/// Compile a bare rule list with no token defaults and no data.
pub fn compile_rules(rules: &[RuleSpec]) -> Result<PolicySet> {
    compile(&PolicyDocument::with_rules(rules.to_vec()))
}

/// Settings a child inherits from its parent.
#[derive(Clone)]
struct Frame {
    id: RuleId,
    kind: RuleKind,
    effect: Effect,
    methods: MethodSet,
    depth: u16,
    segments: Vec<Segment>,
    pieces: Vec<String>,
    regex_node: Option<usize>,
    token_spec: Option<TokenSpec>,
    claims: BTreeMap<String, ClaimValue>,
    require_token: bool,
    token: Option<Arc<TokenRequirement>>,
    predicate: Option<Arc<Predicate>>,
}

struct Compiler<'a> {
    token_defaults: Option<&'a TokenSpec>,
    bindings: Bindings<'a>,
    rules: Vec<CompiledRule>,
    paths: PathMatcher,
    regexes: RegexMatcher,
    tokens: TokenMatcher,
    seen: HashMap<(RuleKind, String), HashSet<String>>,
}

impl<'a> Compiler<'a> {
    fn new(token_defaults: Option<&'a TokenSpec>, bindings: Bindings<'a>) -> Self {
        Self {
            token_defaults,
            bindings,
            rules: Vec::new(),
            paths: PathMatcher::new(),
            regexes: RegexMatcher::new(),
            tokens: TokenMatcher::new(),
            seen: HashMap::new(),
        }
    }

    fn finish(self, name: Option<String>) -> PolicySet {
        let matchers = vec![
            Matcher::Path(self.paths),
            Matcher::Regex(self.regexes),
            Matcher::Token(self.tokens),
        ];
        PolicySet::new(name, self.rules, matchers)
    }

    fn rule(&mut self, spec: &RuleSpec, parent: Option<&Frame>, location: &str) -> Result<()> {
        let depth = parent.map_or(1, |p| p.depth + 1);
        if depth > MAX_DEPTH {
            return Err(Error::compile(format!(
                "rules nest deeper than {} levels",
                MAX_DEPTH
            )));
        }

        let kind = match (spec.kind, parent) {
            (Some(kind), Some(p)) if kind != p.kind => {
                return Err(Error::compile(format!(
                    "child kind `{}` differs from parent kind `{}`",
                    kind, p.kind
                )));
            }
            (Some(kind), _) => kind,
            (None, Some(p)) => p.kind,
            (None, None) => return Err(Error::compile("top-level rule must declare a kind")),
        };

        let methods = if spec.methods.is_empty() {
            parent.map_or(MethodSet::Any, |p| p.methods.clone())
        } else {
            parse_methods(&spec.methods)?
        };
        let effect = spec
            .effect
            .or_else(|| parent.map(|p| p.effect))
            .unwrap_or(Effect::Allow);

        let (token_spec, claims, require_token, token) = self.token_for(spec, kind, parent)?;

        let predicate = match &spec.predicate {
            Some(p) => Some(Arc::new(Predicate::compile(p, self.bindings)?)),
            None => parent.and_then(|p| p.predicate.clone()),
        };
        if predicate.as_ref().map_or(false, |p| p.needs_claims()) && token.is_none() {
            return Err(Error::compile("predicate reads token claims but the rule requires no token"));
        }

        let id = RuleId::try_from(self.rules.len())
            .map_err(|_| Error::compile("too many rules"))?;
        let candidate = Candidate {
            rule_id: id,
            depth,
            methods: methods.clone(),
        };

        let mut segments = parent.map(|p| p.segments.clone()).unwrap_or_default();
        let mut pieces = parent.map(|p| p.pieces.clone()).unwrap_or_default();
        let mut regex_node = None;

        let pattern = match kind {
            RuleKind::Json | RuleKind::Jwt => {
                segments.extend(parse_template(&spec.pattern)?);
                check_params(&segments)?;
                let shape = template_shape(&segments);
                self.claim_slot(kind, &shape, &methods)?;
                match kind {
                    RuleKind::Json => self.paths.insert(&segments, candidate)?,
                    _ => self.tokens.insert(&segments, candidate)?,
                }
                display_template(&segments)
            }
            RuleKind::Regex => {
                pieces.push(normalize_piece(&spec.pattern)?);
                let node = self
                    .regexes
                    .add(parent.and_then(|p| p.regex_node), &pieces, candidate)?;
                regex_node = Some(node);
                let expression = self.regexes.expression(node).unwrap_or_default().to_string();
                self.claim_slot(kind, &expression, &methods)?;
                expression
            }
        };

        if let Some(p) = parent {
            if let Some(parent_rule) = self.rules.get_mut(p.id as usize) {
                parent_rule.children.push(id);
            }
        }
        self.rules.push(CompiledRule {
            id,
            name: spec.name.clone(),
            kind,
            pattern,
            effect,
            methods: methods.clone(),
            depth,
            parent: parent.map(|p| p.id),
            children: Vec::new(),
            token: token.clone(),
            predicate: predicate.clone(),
        });

        let frame = Frame {
            id,
            kind,
            effect,
            methods,
            depth,
            segments,
            pieces,
            regex_node,
            token_spec,
            claims,
            require_token,
            token,
            predicate,
        };
        for (j, child) in spec.children.iter().enumerate() {
            let child_location = format!("{}.children[{}]", location, j);
            self.rule(child, Some(&frame), &child_location)
                .at_rule(child_location.as_str())?;
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn token_for(
        &self,
        spec: &RuleSpec,
        kind: RuleKind,
        parent: Option<&Frame>,
    ) -> Result<(
        Option<TokenSpec>,
        BTreeMap<String, ClaimValue>,
        bool,
        Option<Arc<TokenRequirement>>,
    )> {
        if kind == RuleKind::Jwt && spec.require_token == Some(false) {
            return Err(Error::compile("jwt rules always require a token"));
        }

        let unchanged = spec.token.is_none() && spec.claims.is_empty() && spec.require_token.is_none();
        if let (Some(p), true) = (parent, unchanged) {
            return Ok((p.token_spec.clone(), p.claims.clone(), p.require_token, p.token.clone()));
        }

        let base = parent
            .and_then(|p| p.token_spec.clone())
            .or_else(|| self.token_defaults.cloned());
        let token_spec = match (&spec.token, base) {
            (Some(own), Some(base)) => Some(merge_token(&base, own)),
            (Some(own), None) => Some(own.clone()),
            (None, base) => base,
        };

        let mut claims = parent.map(|p| p.claims.clone()).unwrap_or_default();
        claims.extend(spec.claims.iter().map(|(k, v)| (k.clone(), v.clone())));

        let require_token = kind == RuleKind::Jwt
            || !claims.is_empty()
            || spec
                .require_token
                .unwrap_or_else(|| parent.map_or(false, |p| p.require_token));

        let token = if require_token {
            let settings = token_spec
                .as_ref()
                .ok_or_else(|| Error::compile("rule requires a token but no key is configured"))?;
            Some(Arc::new(TokenRequirement::compile(settings, &claims)?))
        } else {
            None
        };

        Ok((token_spec, claims, require_token, token))
    }

    /// Reserve (kind, shape, method) slots, rejecting duplicates.
    fn claim_slot(&mut self, kind: RuleKind, shape: &str, methods: &MethodSet) -> Result<()> {
        let taken = self.seen.entry((kind, shape.to_string())).or_default();
        for label in methods.labels() {
            let clash = taken.contains(label)
                || taken.contains("*")
                || (label == "*" && !taken.is_empty());
            if clash {
                return Err(Error::compile(format!(
                    "duplicate {} rule for {} {}",
                    kind, label, shape
                )));
            }
        }
        taken.extend(methods.labels().into_iter().map(str::to_string));
        Ok(())
    }
}

fn merge_token(base: &TokenSpec, own: &TokenSpec) -> TokenSpec {
    let (key, key_file) = if own.has_key() {
        (own.key.clone(), own.key_file.clone())
    } else {
        (base.key.clone(), base.key_file.clone())
    };
    TokenSpec {
        algorithm: own.algorithm.or(base.algorithm),
        key,
        key_file,
    }
}

fn parse_methods(raw: &[String]) -> Result<MethodSet> {
    let mut methods: Vec<String> = Vec::with_capacity(raw.len());
    for m in raw {
        let upper = m.trim().to_ascii_uppercase();
        if upper != "*" && !HTTP_METHODS.contains(&upper.as_str()) {
            return Err(Error::compile(format!("unknown method `{}`", m)));
        }
        if !methods.contains(&upper) {
            methods.push(upper);
        }
    }
    if methods.iter().any(|m| m == "*") {
        if methods.len() > 1 {
            return Err(Error::compile("`*` cannot be combined with other methods"));
        }
        return Ok(MethodSet::Any);
    }
    Ok(MethodSet::Only(methods))
}

fn check_params(segments: &[Segment]) -> Result<()> {
    let mut names = HashSet::new();
    for name in param_names(segments) {
        if !names.insert(name) {
            return Err(Error::compile(format!("duplicate placeholder `{{{}}}`", name)));
        }
    }
    Ok(())
}

fn display_template(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    segments.iter().map(|s| format!("/{}", s)).collect()
}
