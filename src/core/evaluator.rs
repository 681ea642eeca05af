//! Request evaluation against a compiled [`PolicySet`].

use super::policy_set::PolicySet;
use crate::api::{Decision, Reason, RequestDescriptor};
use crate::matcher::TokenVerdict;

/// Decide a single request.
///
/// Pure and deterministic: the same descriptor against the same set always
/// yields the same decision.
///
/// 1. A malformed path or method denies with `invalid-request`.
/// 2. Matchers run in dispatch order; no match denies with `default-deny`.
/// 3. The winning rule's token requirement, then its predicate, must hold.
/// 4. Otherwise the rule's effect applies.
pub fn decide(desc: &RequestDescriptor, set: &PolicySet) -> Decision {
    let target = match desc.target() {
        Some(target) => target,
        None => return Decision::invalid_request(),
    };

    let rule = match set.locate(&target).and_then(|m| set.rule(m.rule_id)) {
        Some(rule) => rule,
        None => return Decision::default_deny(),
    };

    let claims = match &rule.token {
        Some(requirement) => match requirement.verify(desc.token.as_deref()) {
            TokenVerdict::Verified(claims) => Some(claims),
            TokenVerdict::Missing => return Decision::deny_by(rule.id, Reason::NoToken),
            TokenVerdict::Invalid(detail) => {
                tracing::debug!(rule = rule.id, %detail, "token rejected");
                return Decision::deny_by(rule.id, Reason::InvalidToken);
            }
            TokenVerdict::ClaimsDenied(detail) => {
                tracing::debug!(rule = rule.id, %detail, "token claims rejected");
                return Decision::deny_by(rule.id, Reason::ClaimsDenied);
            }
        },
        None => None,
    };

    if let Some(predicate) = &rule.predicate {
        if !predicate.holds(desc, claims.as_ref()) {
            return Decision::deny_by(rule.id, Reason::PredicateDenied);
        }
    }

    Decision::from_rule(rule.id, rule.effect)
}
