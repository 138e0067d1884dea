//! Engine configuration.
//!
//! Deployment knowledge the rules need but the wire cannot carry: the
//! client's registered redirect URIs, which built-in rules to leave out,
//! and the thresholds the timing and entropy advisories judge against.
//! Vulnerability toggles are registry-build-time configuration; predicates
//! themselves never branch on config they were not constructed with.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC 6749 section 4.1.2 recommends authorization codes live at most ten
/// minutes.
pub const DEFAULT_AUTHORIZATION_CODE_LIFETIME_SECS: i64 = 600;

/// RFC 8628 section 3.2: poll interval to assume when the device
/// authorization response omits `interval`.
pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 5;

/// Estimated-entropy floor for `state` values, in millionths of bits.
/// Deliberately far below the BCP's 128-bit generator recommendation; the
/// single-sample estimate undershoots.
pub const DEFAULT_MIN_STATE_ENTROPY_MILLIBITS: i64 = 32_000_000;

/// Length floor for `state` values.
pub const DEFAULT_MIN_STATE_LENGTH: usize = 8;

/// RFC 8628 section 6.1: user codes should carry about 20 bits of entropy.
pub const DEFAULT_MIN_USER_CODE_ENTROPY_MILLIBITS: i64 = 20_000_000;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Redirect URIs registered for the client under test. The redirect
    /// rule accepts a captured `redirect_uri` only when it is byte-identical
    /// to one of these.
    pub registered_redirect_uris: BTreeSet<String>,
    /// Built-in rule ids to leave out of the registry.
    pub disabled_rules: BTreeSet<String>,
    /// Maximum tolerated authorization-code age at exchange time.
    pub authorization_code_lifetime_secs: i64,
    /// Poll interval assumed when the server declares none.
    pub default_poll_interval_secs: i64,
    pub min_state_entropy_millibits: i64,
    pub min_state_length: usize,
    pub min_user_code_entropy_millibits: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registered_redirect_uris: BTreeSet::new(),
            disabled_rules: BTreeSet::new(),
            authorization_code_lifetime_secs: DEFAULT_AUTHORIZATION_CODE_LIFETIME_SECS,
            default_poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            min_state_entropy_millibits: DEFAULT_MIN_STATE_ENTROPY_MILLIBITS,
            min_state_length: DEFAULT_MIN_STATE_LENGTH,
            min_user_code_entropy_millibits: DEFAULT_MIN_USER_CODE_ENTROPY_MILLIBITS,
        }
    }
}

impl EngineConfig {
    pub fn with_registered_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.registered_redirect_uris.insert(uri.into());
        self
    }

    pub fn with_disabled_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.disabled_rules.insert(rule_id.into());
        self
    }

    /// Validate eagerly, before any registry is built from this config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authorization_code_lifetime_secs <= 0 {
            return Err(ConfigError::NonPositiveCodeLifetime {
                secs: self.authorization_code_lifetime_secs,
            });
        }
        if self.default_poll_interval_secs <= 0 {
            return Err(ConfigError::NonPositivePollInterval {
                secs: self.default_poll_interval_secs,
            });
        }
        if self.min_state_entropy_millibits < 0 || self.min_user_code_entropy_millibits < 0 {
            return Err(ConfigError::NegativeEntropyFloor);
        }
        if self.registered_redirect_uris.iter().any(|u| u.is_empty()) {
            return Err(ConfigError::EmptyRedirectUri);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("authorization code lifetime must be positive, got {secs}s")]
    NonPositiveCodeLifetime { secs: i64 },

    #[error("default poll interval must be positive, got {secs}s")]
    NonPositivePollInterval { secs: i64 },

    #[error("entropy floors must be non-negative")]
    NegativeEntropyFloor,

    #[error("registered redirect URI must not be empty")]
    EmptyRedirectUri,
}

/// Stable error codes for configuration validation.
pub fn error_code(err: &ConfigError) -> &'static str {
    match err {
        ConfigError::NonPositiveCodeLifetime { .. } => "CONFIG_NON_POSITIVE_CODE_LIFETIME",
        ConfigError::NonPositivePollInterval { .. } => "CONFIG_NON_POSITIVE_POLL_INTERVAL",
        ConfigError::NegativeEntropyFloor => "CONFIG_NEGATIVE_ENTROPY_FLOOR",
        ConfigError::EmptyRedirectUri => "CONFIG_EMPTY_REDIRECT_URI",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
