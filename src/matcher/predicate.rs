//! Compiled predicates over request metadata.
//!
//! `in_data` expressions and `$name` variables are resolved against the
//! policy document when the rule is compiled, so evaluation is a set lookup.

use super::token::{claim, Claims};
use crate::api::RequestDescriptor;
use crate::policy::{PredicateSpec, Vars};
use crate::{Error, Result};

use serde_json::Value;
use std::collections::HashSet;

/// Request metadata a predicate can test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Caller identity header
    Source,
    /// Request path
    Path,
    /// Request method
    Method,
    /// Whether the request carries a token
    TokenPresent,
    /// A verified token claim (dotted name)
    Claim(String),
}

impl Field {
    /// Parse a field reference.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "source" => Ok(Field::Source),
            "path" => Ok(Field::Path),
            "method" => Ok(Field::Method),
            "token_present" => Ok(Field::TokenPresent),
            other => match other.strip_prefix("claims.") {
                Some(name) if !name.is_empty() => Ok(Field::Claim(name.to_string())),
                _ => Err(Error::compile(format!("unknown predicate field `{}`", raw))),
            },
        }
    }

    fn resolve(&self, desc: &RequestDescriptor, claims: Option<&Claims>) -> Option<Value> {
        match self {
            Field::Source => desc.source.clone().map(Value::String),
            Field::Path => Some(Value::String(desc.path.clone())),
            Field::Method => Some(Value::String(desc.method.clone())),
            Field::TokenPresent => Some(Value::Bool(desc.has_token())),
            Field::Claim(name) => claims.and_then(|c| claim(c, name)).cloned(),
        }
    }
}

/// A set of accepted values; strings are hashed, everything else is scanned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptSet {
    strings: HashSet<String>,
    others: Vec<Value>,
}

impl AcceptSet {
    /// Add values, flattening one level of arrays.
    fn extend<'a>(&mut self, values: impl IntoIterator<Item = &'a Value>) {
        for value in values {
            match value {
                Value::Array(items) => items.iter().for_each(|v| self.insert(v)),
                other => self.insert(other),
            }
        }
    }

    fn insert(&mut self, value: &Value) {
        match value {
            Value::String(s) => {
                self.strings.insert(s.clone());
            }
            other => {
                if !self.others.contains(other) {
                    self.others.push(other.clone());
                }
            }
        }
    }

    /// Membership test.
    pub fn contains(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.strings.contains(s),
            other => self.others.contains(other),
        }
    }

    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.strings.len() + self.others.len()
    }

    /// Whether no value is accepted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Test {
    Equals(Value),
    Member(AcceptSet),
    Exists(bool),
}

/// Document-level values a predicate may refer to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bindings<'a> {
    /// Structured data for selections
    pub data: Option<&'a Value>,
    /// Named value lists for `$name` references
    pub vars: Option<&'a Vars>,
}

impl<'a> Bindings<'a> {
    /// Bindings with data and no variables.
    pub fn with_data(data: &'a Value) -> Self {
        Self {
            data: Some(data),
            vars: None,
        }
    }

    fn select_into(&self, expression: &str, set: &mut AcceptSet) -> Result<()> {
        let data = self.data.ok_or_else(|| {
            Error::compile(format!(
                "predicate `{}` refers to policy data but none is loaded",
                expression
            ))
        })?;
        let steps = parse_data_path(expression)?;
        set.extend(select(data, &steps));
        Ok(())
    }

    fn expand_var(&self, name: &str, set: &mut AcceptSet) -> Result<()> {
        let entries = self
            .vars
            .and_then(|vars| vars.get(name))
            .ok_or_else(|| Error::compile(format!("undefined variable `${}`", name)))?;
        for raw in entries {
            match VarEntry::classify(name, raw)? {
                VarEntry::Literal(value) => set.insert(&Value::String(value.to_string())),
                VarEntry::Selection(expression) => self.select_into(expression, set)?,
            }
        }
        Ok(())
    }
}

/// The variable named by a `$name` reference. `$.x` and `$[0]` are data
/// selections, not variables.
fn var_ref(raw: &str) -> Option<&str> {
    raw.strip_prefix('$').filter(|name| is_var_name(name))
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

enum VarEntry<'a> {
    Literal(&'a str),
    Selection(&'a str),
}

impl<'a> VarEntry<'a> {
    fn classify(var: &str, raw: &'a str) -> Result<Self> {
        let entry = raw.trim();
        if entry.is_empty() {
            return Err(Error::compile(format!("variable `${}` has an empty entry", var)));
        }
        if let Some(inner) = var_ref(entry) {
            return Err(Error::compile(format!(
                "variable `${}` refers to `${}`; variables cannot nest",
                var, inner
            )));
        }
        if entry.starts_with('{') || entry.starts_with("$.") || entry.starts_with("$[") {
            parse_data_path(entry)?;
            Ok(VarEntry::Selection(entry))
        } else {
            Ok(VarEntry::Literal(entry))
        }
    }
}

/// Validate every variable of a document, used or not.
pub fn check_vars(vars: &Vars) -> Result<()> {
    for (name, entries) in vars {
        if !is_var_name(name) {
            return Err(Error::compile(format!("invalid variable name `{}`", name)));
        }
        for entry in entries {
            VarEntry::classify(name, entry)?;
        }
    }
    Ok(())
}

/// A compiled predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    field: Field,
    test: Test,
}

impl Predicate {
    /// Compile a predicate, resolving `in_data` and `$name` references.
    pub fn compile(spec: &PredicateSpec, bindings: Bindings<'_>) -> Result<Self> {
        if spec.test_count() != 1 {
            return Err(Error::compile(format!(
                "predicate on `{}` must set exactly one of equals, one_of, in_data, exists",
                spec.field
            )));
        }
        let field = Field::parse(&spec.field)?;

        let test = if let Some(value) = &spec.equals {
            Test::Equals(value.clone())
        } else if let Some(values) = &spec.one_of {
            let mut set = AcceptSet::default();
            for value in values {
                match value.as_str().and_then(var_ref) {
                    Some(name) => bindings.expand_var(name, &mut set)?,
                    None => set.extend(Some(value)),
                }
            }
            Test::Member(set)
        } else if let Some(expression) = &spec.in_data {
            let mut set = AcceptSet::default();
            match var_ref(expression.trim()) {
                Some(name) => bindings.expand_var(name, &mut set)?,
                None => bindings.select_into(expression, &mut set)?,
            }
            if set.is_empty() {
                tracing::warn!(expression = %expression, "data expression selects no values");
            }
            Test::Member(set)
        } else {
            Test::Exists(spec.exists.unwrap_or(true))
        };

        Ok(Self { field, test })
    }

    /// Whether the predicate reads token claims.
    pub fn needs_claims(&self) -> bool {
        matches!(self.field, Field::Claim(_))
    }

    /// Evaluate against a request and its verified claims, if any.
    pub fn holds(&self, desc: &RequestDescriptor, claims: Option<&Claims>) -> bool {
        let value = self.field.resolve(desc, claims);
        match &self.test {
            Test::Exists(expected) => value.is_some() == *expected,
            Test::Equals(expected) => value.map_or(false, |v| match &v {
                Value::Array(items) if !expected.is_array() => items.contains(expected),
                other => other == expected,
            }),
            Test::Member(set) => value.map_or(false, |v| match &v {
                Value::Array(items) => items.iter().any(|item| set.contains(item)),
                other => set.contains(other),
            }),
        }
    }
}

/// One step of a data selection expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Object member
    Key(String),
    /// Array element
    Index(usize),
    /// Every array element or object member
    Wildcard,
}

/// Parse a selection expression such as `{.team1[*].name}` or `$.team1[0]['name']`.
pub fn parse_data_path(expression: &str) -> Result<Vec<Step>> {
    let invalid = |why: &str| Error::compile(format!("invalid data expression `{}`: {}", expression, why));

    let mut body = expression.trim();
    if let Some(inner) = body.strip_prefix('{') {
        body = inner.strip_suffix('}').ok_or_else(|| invalid("unbalanced braces"))?;
    }
    body = body.strip_prefix('$').unwrap_or(body);

    let chars: Vec<char> = body.chars().collect();
    let mut steps = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                if chars.get(i) == Some(&'*') {
                    steps.push(Step::Wildcard);
                    i += 1;
                    continue;
                }
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                if start == i {
                    return Err(invalid("empty member name"));
                }
                steps.push(Step::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| invalid("unclosed bracket"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                if inner == "*" {
                    steps.push(Step::Wildcard);
                } else if let Some(key) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                {
                    steps.push(Step::Key(key.to_string()));
                } else {
                    let idx = inner.parse::<usize>().map_err(|_| invalid("bad index"))?;
                    steps.push(Step::Index(idx));
                }
                i = close + 1;
            }
            _ if steps.is_empty() => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                steps.push(Step::Key(chars[start..i].iter().collect()));
            }
            c => return Err(invalid(&format!("unexpected `{}`", c))),
        }
    }

    if steps.is_empty() {
        return Err(invalid("selects the whole document"));
    }
    Ok(steps)
}

/// Apply a parsed selection to a document.
pub fn select<'a>(data: &'a Value, steps: &[Step]) -> Vec<&'a Value> {
    let mut current = vec![data];
    for step in steps {
        let mut next = Vec::new();
        for value in current {
            match (step, value) {
                (Step::Key(k), Value::Object(map)) => next.extend(map.get(k)),
                (Step::Index(n), Value::Array(items)) => next.extend(items.get(*n)),
                (Step::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                (Step::Wildcard, Value::Object(map)) => next.extend(map.values()),
                _ => {}
            }
        }
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Value {
        json!({
            "team1": [{"name": "client1"}, {"name": "client2"}],
            "team2": [{"name": "client3"}],
            "admins": ["root", "ops"],
        })
    }

    fn request(source: Option<&str>) -> RequestDescriptor {
        let mut builder = RequestDescriptor::builder().with_path("/json_1/1").with_method("get");
        if let Some(s) = source {
            builder = builder.with_source(s);
        }
        builder.build()
    }

    #[test]
    fn test_parse_data_path() {
        assert_eq!(
            parse_data_path("{.team1[*].name}").unwrap(),
            vec![
                Step::Key("team1".into()),
                Step::Wildcard,
                Step::Key("name".into())
            ]
        );
        assert_eq!(
            parse_data_path("$.team1[0]['name']").unwrap(),
            vec![
                Step::Key("team1".into()),
                Step::Index(0),
                Step::Key("name".into())
            ]
        );
        assert_eq!(parse_data_path("admins").unwrap(), vec![Step::Key("admins".into())]);
        assert!(parse_data_path("{.team1").is_err());
        assert!(parse_data_path("{.team1[x]}").is_err());
        assert!(parse_data_path("{}").is_err());
        assert!(parse_data_path(".a..b").is_err());
    }

    #[test]
    fn test_select() {
        let d = data();
        let steps = parse_data_path("{.team1[*].name}").unwrap();
        assert_eq!(select(&d, &steps), vec![&json!("client1"), &json!("client2")]);
        let steps = parse_data_path("{.team9[*].name}").unwrap();
        assert!(select(&d, &steps).is_empty());
    }

    fn plain(spec: PredicateSpec) -> Result<Predicate> {
        Predicate::compile(&spec, Bindings::default())
    }

    fn vars() -> Vars {
        let mut vars = Vars::new();
        vars.insert("ops".into(), vec!["root".into(), "{.team2[*].name}".into()]);
        vars.insert("admins".into(), vec!["alice".into(), "bob".into()]);
        vars
    }

    #[test]
    fn test_in_data_predicate() {
        let d = data();
        let spec = PredicateSpec::in_data("source", "{.team1[*].name}");
        let p = Predicate::compile(&spec, Bindings::with_data(&d)).unwrap();
        assert!(p.holds(&request(Some("client2")), None));
        assert!(!p.holds(&request(Some("client3")), None));
        assert!(!p.holds(&request(None), None));
        assert!(!p.needs_claims());
    }

    #[test]
    fn test_in_data_flattens_arrays() {
        let d = data();
        let spec = PredicateSpec::in_data("source", "{.admins}");
        let p = Predicate::compile(&spec, Bindings::with_data(&d)).unwrap();
        assert!(p.holds(&request(Some("ops")), None));
    }

    #[test]
    fn test_in_data_without_data() {
        assert!(plain(PredicateSpec::in_data("source", "{.team1}")).is_err());
    }

    #[test]
    fn test_equals_and_one_of() {
        let p = plain(PredicateSpec::equals("method", "GET")).unwrap();
        assert!(p.holds(&request(None), None));

        let p = plain(PredicateSpec::one_of("source", vec![json!("a"), json!("b")])).unwrap();
        assert!(p.holds(&request(Some("b")), None));
        assert!(!p.holds(&request(Some("c")), None));
    }

    #[test]
    fn test_one_of_expands_variables() {
        let (d, vars) = (data(), vars());
        let bindings = Bindings {
            data: Some(&d),
            vars: Some(&vars),
        };
        let spec = PredicateSpec::one_of("source", vec![json!("$ops"), json!("guest")]);
        let p = Predicate::compile(&spec, bindings).unwrap();
        for allowed in ["root", "client3", "guest"] {
            assert!(p.holds(&request(Some(allowed)), None), "{}", allowed);
        }
        assert!(!p.holds(&request(Some("client2")), None));
        assert!(!p.holds(&request(Some("$ops")), None));

        let p = Predicate::compile(&PredicateSpec::in_data("source", "$admins"), bindings).unwrap();
        assert!(p.holds(&request(Some("bob")), None));
        assert!(!p.holds(&request(Some("root")), None));

        // `$.` is still a data selection.
        let p = Predicate::compile(&PredicateSpec::in_data("source", "$.admins"), bindings).unwrap();
        assert!(p.holds(&request(Some("root")), None));
    }

    #[test]
    fn test_variable_errors() {
        let d = data();
        let mut vars = vars();
        let bindings = Bindings {
            data: Some(&d),
            vars: Some(&vars),
        };
        let err = Predicate::compile(&PredicateSpec::in_data("source", "$nobody"), bindings)
            .unwrap_err();
        assert!(err.to_string().contains("undefined variable `$nobody`"));

        let err = plain(PredicateSpec::one_of("source", vec![json!("$admins")])).unwrap_err();
        assert!(err.to_string().contains("undefined variable"));

        // Selections inside a variable still need data.
        let no_data = Bindings {
            data: None,
            vars: Some(&vars),
        };
        assert!(Predicate::compile(&PredicateSpec::in_data("source", "$ops"), no_data).is_err());

        check_vars(&vars).unwrap();
        vars.insert("all".into(), vec!["carol".into(), "$admins".into()]);
        let err = check_vars(&vars).unwrap_err();
        assert!(err.to_string().contains("cannot nest"));

        let mut vars = Vars::new();
        vars.insert("blank".into(), vec!["  ".into()]);
        assert!(check_vars(&vars).is_err());

        let mut vars = Vars::new();
        vars.insert("9lives".into(), vec!["cat".into()]);
        assert!(check_vars(&vars).is_err());
    }

    #[test]
    fn test_exists_and_token_present() {
        let p = plain(PredicateSpec::exists("source", false)).unwrap();
        assert!(p.holds(&request(None), None));
        assert!(!p.holds(&request(Some("x")), None));

        let p = plain(PredicateSpec::equals("token_present", true)).unwrap();
        let with_token = RequestDescriptor::builder()
            .with_path("/a")
            .with_method("GET")
            .with_token("a.b.c")
            .build();
        assert!(p.holds(&with_token, None));
        assert!(!p.holds(&request(None), None));
    }

    #[test]
    fn test_claim_predicate() {
        let p = plain(PredicateSpec::equals("claims.role", "admin")).unwrap();
        assert!(p.needs_claims());
        let claims: Claims = serde_json::from_value(json!({"role": ["dev", "admin"]})).unwrap();
        assert!(p.holds(&request(None), Some(&claims)));
        assert!(!p.holds(&request(None), None));
    }

    #[test]
    fn test_invalid_predicates() {
        assert!(plain(PredicateSpec::default()).is_err());
        assert!(plain(PredicateSpec::equals("header", "x")).is_err());
        assert!(plain(PredicateSpec::equals("claims.", "x")).is_err());
        let mut two = PredicateSpec::equals("source", "a");
        two.exists = Some(true);
        assert!(plain(two).is_err());
    }
}
