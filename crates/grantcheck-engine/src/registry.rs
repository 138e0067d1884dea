//! Rule registry: populated at startup, immutable while evaluating.
//!
//! Registration happens through `&mut self` and stops forever at the first
//! read: [`RuleRegistry::rules_for`] flips a freeze flag, after which
//! [`RuleRegistry::register`] fails with [`RegistryError::Frozen`]. Once
//! frozen the registry is shared by `&self` only, so concurrent evaluators
//! read it without any lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::grant::GrantType;
use crate::rule::Rule;

/// Structural misuse of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A rule with this id is already registered. Silent replacement would
    /// make findings ambiguous, so the second registration is rejected.
    #[error("rule id `{id}` is already registered")]
    DuplicateRuleId { id: String },

    /// The registry has served at least one read; the rule set is final.
    #[error("registry is frozen after first read; register rules at startup")]
    Frozen,
}

/// Stable error codes for the registry.
pub fn error_code(err: &RegistryError) -> &'static str {
    match err {
        RegistryError::DuplicateRuleId { .. } => "REGISTRY_DUPLICATE_RULE_ID",
        RegistryError::Frozen => "REGISTRY_FROZEN",
    }
}

#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    ids: BTreeSet<String>,
    frozen: AtomicBool,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one rule. Startup only; fails once any read has happened.
    pub fn register(&mut self, rule: Rule) -> Result<(), RegistryError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(RegistryError::Frozen);
        }
        if !self.ids.insert(rule.id().to_string()) {
            return Err(RegistryError::DuplicateRuleId {
                id: rule.id().to_string(),
            });
        }
        self.rules.push(rule);
        Ok(())
    }

    /// All rules applicable to the grant type, in registration order.
    /// The first call freezes the registry.
    pub fn rules_for(&self, grant_type: GrantType) -> Vec<&Rule> {
        self.frozen.store(true, Ordering::Release);
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(grant_type))
            .collect()
    }

    /// Whether the registry holds any rule for the grant type. Does not
    /// freeze; used for the unknown-grant check before evaluation.
    pub fn covers(&self, grant_type: GrantType) -> bool {
        self.rules.iter().any(|rule| rule.applies_to(grant_type))
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleOutcome, Severity};

    fn rule(id: &str, grant: GrantType) -> Rule {
        Rule::new(id, [grant], "RFC 0000", Severity::Low, |_s| RuleOutcome::Pass)
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("R-1", GrantType::Implicit)).unwrap();
        let err = reg.register(rule("R-1", GrantType::DeviceCode)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRuleId { ref id } if id == "R-1"));
        assert_eq!(error_code(&err), "REGISTRY_DUPLICATE_RULE_ID");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn first_read_freezes_registration() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("R-1", GrantType::Implicit)).unwrap();
        assert!(!reg.is_frozen());

        let found = reg.rules_for(GrantType::Implicit);
        assert_eq!(found.len(), 1);
        assert!(reg.is_frozen());

        let err = reg.register(rule("R-2", GrantType::Implicit)).unwrap_err();
        assert!(matches!(err, RegistryError::Frozen));
        assert_eq!(error_code(&err), "REGISTRY_FROZEN");
    }

    #[test]
    fn rules_come_back_in_registration_order() {
        let mut reg = RuleRegistry::new();
        for id in ["R-B", "R-A", "R-C"] {
            reg.register(rule(id, GrantType::ClientCredentials)).unwrap();
        }
        reg.register(rule("R-OTHER", GrantType::DeviceCode)).unwrap();

        let ids: Vec<&str> = reg
            .rules_for(GrantType::ClientCredentials)
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, ["R-B", "R-A", "R-C"]);
    }

    #[test]
    fn covers_does_not_freeze() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("R-1", GrantType::Implicit)).unwrap();
        assert!(reg.covers(GrantType::Implicit));
        assert!(!reg.covers(GrantType::DeviceCode));
        assert!(!reg.is_frozen());
        reg.register(rule("R-2", GrantType::Implicit)).unwrap();
    }
}
