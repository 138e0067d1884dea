//! Built-in conformance rule catalog.
//!
//! One rule per `(concern, grant set)`: checks that apply to several flows
//! (HTTPS, token shape, state binding) live in [`shared`] parameterized by
//! grant type instead of being copied per flow. Per-flow obligations live
//! in their flow's module. Rule ids are stable strings; disabling a rule is
//! registry-build-time configuration through
//! [`EngineConfig::disabled_rules`](crate::config::EngineConfig).

pub mod authorization_code;
pub mod client_credentials;
pub mod device;
pub mod implicit;
pub mod shared;

use crate::config::EngineConfig;
use crate::registry::{RegistryError, RuleRegistry};
use crate::rule::Rule;
use crate::session::FlowSession;

/// The full built-in catalog, honoring `config.disabled_rules`.
/// Registration order is shared rules first, then per-flow rules.
pub fn builtin_rules(config: &EngineConfig) -> Vec<Rule> {
    let mut rules = Vec::new();
    rules.extend(shared::rules(config));
    rules.extend(implicit::rules(config));
    rules.extend(device::rules(config));
    rules.extend(client_credentials::rules(config));
    rules.extend(authorization_code::rules(config));
    rules.retain(|rule| !config.disabled_rules.contains(rule.id()));
    rules
}

/// A frozen-ready registry holding the built-in catalog.
pub fn builtin_registry(config: &EngineConfig) -> Result<RuleRegistry, RegistryError> {
    let mut registry = RuleRegistry::new();
    for rule in builtin_rules(config) {
        registry.register(rule)?;
    }
    Ok(registry)
}

/// Param value of the first step with the given name, if both exist.
pub(crate) fn step_param<'a>(session: &'a FlowSession, step: &str, key: &str) -> Option<&'a str> {
    session.get_step(step).ok().and_then(|s| s.param(key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn builtin_ids_are_unique_and_registry_builds() {
        let config = EngineConfig::default();
        let rules = builtin_rules(&config);
        let ids: BTreeSet<&str> = rules.iter().map(|r| r.id()).collect();
        assert_eq!(ids.len(), rules.len(), "duplicate rule id in catalog");

        let registry = builtin_registry(&config).unwrap();
        assert_eq!(registry.len(), rules.len());
    }

    #[test]
    fn every_grant_type_is_covered() {
        let registry = builtin_registry(&EngineConfig::default()).unwrap();
        for grant in crate::grant::GrantType::ALL {
            assert!(registry.covers(grant), "no rules for {grant}");
        }
    }

    #[test]
    fn disabled_rules_are_left_out() {
        let config = EngineConfig::default().with_disabled_rule(shared::SH_STATE_ENTROPY);
        let rules = builtin_rules(&config);
        assert!(rules.iter().all(|r| r.id() != shared::SH_STATE_ENTROPY));

        let full = builtin_rules(&EngineConfig::default());
        assert_eq!(rules.len() + 1, full.len());
    }

    #[test]
    fn every_rule_names_a_citation() {
        for rule in builtin_rules(&EngineConfig::default()) {
            assert!(!rule.citation().is_empty(), "{} lacks a citation", rule.id());
            assert!(!rule.grants().is_empty(), "{} applies to no grant", rule.id());
        }
    }
}
