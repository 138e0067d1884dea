//! Grant-type and flow-outcome vocabulary.
//!
//! The grant type is fixed when a flow session is created and determines
//! which rule subset and which state machine apply to it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// OAuth 2.0 / OIDC grant flow variant under validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Legacy front-channel flow returning tokens in the URL fragment.
    Implicit,
    /// Device Authorization Grant (RFC 8628) with token-endpoint polling.
    DeviceCode,
    /// Machine-to-machine flow, single token round trip.
    ClientCredentials,
    /// Authorization Code flow hardened with PKCE (RFC 7636).
    AuthorizationCodePkce,
}

impl GrantType {
    pub const ALL: [GrantType; 4] = [
        Self::Implicit,
        Self::DeviceCode,
        Self::ClientCredentials,
        Self::AuthorizationCodePkce,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implicit => "implicit",
            Self::DeviceCode => "device_code",
            Self::ClientCredentials => "client_credentials",
            Self::AuthorizationCodePkce => "authorization_code_pkce",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "implicit" => Some(Self::Implicit),
            "device_code" => Some(Self::DeviceCode),
            "client_credentials" => Some(Self::ClientCredentials),
            "authorization_code_pkce" => Some(Self::AuthorizationCodePkce),
            _ => None,
        }
    }

    /// Whether the flow involves a front-channel authorization redirect.
    pub fn uses_redirect(self) -> bool {
        matches!(self, Self::Implicit | Self::AuthorizationCodePkce)
    }

    /// Whether the flow binds request and response with a `state` value.
    pub fn carries_state(self) -> bool {
        matches!(self, Self::Implicit | Self::AuthorizationCodePkce)
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal disposition of a flow session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    /// Still in progress.
    Pending,
    /// Reached a success terminal state.
    Succeeded,
    /// Reached an error terminal state.
    Failed,
    /// Caller stopped driving the session before a terminal state.
    Abandoned,
}

impl FlowOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for FlowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
