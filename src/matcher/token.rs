//! Bearer-token verification and the `jwt` rule matcher.

use super::path::{insert_reachable, PathTrie, Segment};
use super::{Candidate, MatchResult, MatchTarget};
use crate::policy::{ClaimValue, TokenSpec};
use crate::{Error, Result};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Verified token claims.
pub type Claims = serde_json::Map<String, Value>;

/// Outcome of verifying a request token against a requirement.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenVerdict {
    /// Signature and required claims check out
    Verified(Claims),
    /// No token on the request
    Missing,
    /// Malformed token or bad signature/expiry
    Invalid(String),
    /// Token is valid but a required claim is absent or not accepted
    ClaimsDenied(String),
}

/// A compiled token precondition: key, algorithm and required claims.
pub struct TokenRequirement {
    algorithm: Algorithm,
    key: DecodingKey,
    validation: Validation,
    claims: Vec<(String, Vec<Value>)>,
}

impl fmt::Debug for TokenRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRequirement")
            .field("algorithm", &self.algorithm)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl TokenRequirement {
    /// Build a requirement from effective token settings and required claims.
    ///
    /// Key files are read here, once, so that verification never touches disk.
    pub fn compile(spec: &TokenSpec, claims: &BTreeMap<String, ClaimValue>) -> Result<Self> {
        let algorithm = spec.algorithm.unwrap_or(Algorithm::HS256);

        let material: Vec<u8> = match (&spec.key, &spec.key_file) {
            (Some(key), _) => key.as_bytes().to_vec(),
            (None, Some(path)) => std::fs::read(path).map_err(|e| {
                Error::compile(format!("cannot read key file {}: {}", path.display(), e))
            })?,
            (None, None) => {
                return Err(Error::compile("token verification requires a key or key_file"));
            }
        };
        if material.is_empty() {
            return Err(Error::compile("token key is empty"));
        }

        let key = decoding_key(algorithm, &material)?;

        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        let mut required = Vec::with_capacity(claims.len());
        for (name, value) in claims {
            if name.is_empty() {
                return Err(Error::compile("claim name must not be empty"));
            }
            let accepted = value.accepted();
            if accepted.is_empty() {
                return Err(Error::compile(format!("claim `{}` accepts no values", name)));
            }
            required.push((name.clone(), accepted));
        }

        Ok(Self {
            algorithm,
            key,
            validation,
            claims: required,
        })
    }

    /// Verify a raw token value (with or without a `Bearer ` prefix).
    pub fn verify(&self, raw: Option<&str>) -> TokenVerdict {
        let token = match raw.map(strip_bearer) {
            Some(t) if !t.is_empty() => t,
            _ => return TokenVerdict::Missing,
        };
        if !is_well_formed(token) {
            return TokenVerdict::Invalid("malformed token".to_string());
        }

        let claims = match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => return TokenVerdict::Invalid(e.to_string()),
        };

        for (name, accepted) in &self.claims {
            let actual = match claim(&claims, name) {
                Some(v) => v,
                None => return TokenVerdict::ClaimsDenied(format!("missing claim `{}`", name)),
            };
            let ok = match actual {
                Value::Array(items) => items.iter().any(|item| accepted.contains(item)),
                other => accepted.contains(other),
            };
            if !ok {
                return TokenVerdict::ClaimsDenied(format!("claim `{}` not accepted", name));
            }
        }

        TokenVerdict::Verified(claims)
    }
}

fn decoding_key(algorithm: Algorithm, material: &[u8]) -> Result<DecodingKey> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            return Ok(DecodingKey::from_secret(material));
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(material),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(material),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(material),
    };
    key.map_err(|e| Error::compile(format!("invalid {:?} key: {}", algorithm, e)))
}

/// Strip an optional `Bearer ` scheme prefix.
pub fn strip_bearer(raw: &str) -> &str {
    let raw = raw.trim();
    match raw.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => raw[7..].trim_start(),
        _ => raw,
    }
}

/// Three non-empty dot-separated segments.
pub fn is_well_formed(token: &str) -> bool {
    let mut parts = token.split('.');
    let ok = (0..3).all(|_| parts.next().map_or(false, |p| !p.is_empty()));
    ok && parts.next().is_none()
}

/// Look up a claim by dotted name, e.g. `realm.role`.
pub fn claim<'a>(claims: &'a Claims, dotted: &str) -> Option<&'a Value> {
    if let Some(v) = claims.get(dotted) {
        return Some(v);
    }
    let mut parts = dotted.split('.');
    let mut current = claims.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Matcher for `jwt` rules: path templates whose winner carries a token
/// requirement checked by the evaluator.
#[derive(Debug, Default)]
pub struct TokenMatcher {
    trie: PathTrie,
}

impl TokenMatcher {
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
