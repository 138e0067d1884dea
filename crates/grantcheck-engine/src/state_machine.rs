//! Per-grant flow state machines.
//!
//! Each grant type defines an explicit machine over step names, from
//! [`FlowState::Start`] to a terminal state. The machines are total over
//! observed facts: a response step's params decide which branch is taken
//! (success token vs. error code), so the derived state always reflects what
//! was actually captured, not what the client intended.
//!
//! [`replay`] is lenient: steps that are not legal from the current state
//! leave the state unchanged, so a session polluted by raw `record_step`
//! calls still has a well-defined derived state. [`verify_sequence`] is the
//! strict form the legal-sequence conformance rule is built on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grant::{FlowOutcome, GrantType};
use crate::session::StepRecord;
use crate::wire;

// ---------------------------------------------------------------------------
// Step names
// ---------------------------------------------------------------------------

/// Canonical step names the machines transition on. Capture layers must use
/// these names for steps they want the dispatcher to recognize.
pub mod step {
    /// Front-channel authorization request (Implicit, AuthCode+PKCE).
    pub const AUTHORIZATION_REQUEST: &str = "authorization_request";
    /// Redirect callback carrying the token in the URI fragment (Implicit).
    pub const FRAGMENT_RESPONSE: &str = "fragment_response";
    /// Resource-owner authentication at the authorization server (AuthCode).
    pub const USER_AUTHENTICATION: &str = "user_authentication";
    /// Redirect callback carrying the authorization code (AuthCode).
    pub const AUTHORIZATION_RESPONSE: &str = "authorization_response";
    /// Back-channel token request (Client Credentials, AuthCode+PKCE).
    pub const TOKEN_REQUEST: &str = "token_request";
    /// Token endpoint response (Client Credentials, AuthCode+PKCE).
    pub const TOKEN_RESPONSE: &str = "token_response";
    /// Device authorization request (Device).
    pub const DEVICE_AUTHORIZATION_REQUEST: &str = "device_authorization_request";
    /// Device authorization response with device/user codes (Device).
    pub const DEVICE_AUTHORIZATION_RESPONSE: &str = "device_authorization_response";
    /// One token-endpoint poll attempt (Device).
    pub const TOKEN_POLL: &str = "token_poll";
    /// Token endpoint answer to one poll attempt (Device).
    pub const TOKEN_POLL_RESPONSE: &str = "token_poll_response";
}

// ---------------------------------------------------------------------------
// FlowState
// ---------------------------------------------------------------------------

/// Derived position of a session inside its grant's machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Start,
    // Implicit / AuthCode front channel.
    AuthorizationRequested,
    TokenInFragmentReceived,
    UserAuthenticated,
    AuthorizationResponded,
    // Back channel (Client Credentials, AuthCode).
    TokenRequested,
    // Device.
    DeviceAuthorizationRequested,
    DeviceAuthorizationResponded,
    Polling,
    // Terminals.
    Succeeded,
    ErrorReceived,
    AccessDenied,
    ExpiredToken,
    InvalidClient,
    InvalidScope,
    UnauthorizedClient,
    InvalidGrant,
    OtherError,
}

impl FlowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AuthorizationRequested => "authorization_requested",
            Self::TokenInFragmentReceived => "token_in_fragment_received",
            Self::UserAuthenticated => "user_authenticated",
            Self::AuthorizationResponded => "authorization_responded",
            Self::TokenRequested => "token_requested",
            Self::DeviceAuthorizationRequested => "device_authorization_requested",
            Self::DeviceAuthorizationResponded => "device_authorization_responded",
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::ErrorReceived => "error_received",
            Self::AccessDenied => "access_denied",
            Self::ExpiredToken => "expired_token",
            Self::InvalidClient => "invalid_client",
            Self::InvalidScope => "invalid_scope",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::InvalidGrant => "invalid_grant",
            Self::OtherError => "other_error",
        }
    }

    /// Terminal states accept no further steps.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::ErrorReceived
                | Self::AccessDenied
                | Self::ExpiredToken
                | Self::InvalidClient
                | Self::InvalidScope
                | Self::UnauthorizedClient
                | Self::InvalidGrant
                | Self::OtherError
        )
    }

    /// Session outcome a terminal state maps to; `None` for non-terminals.
    pub fn terminal_outcome(self) -> Option<FlowOutcome> {
        if self == Self::Succeeded {
            Some(FlowOutcome::Succeeded)
        } else if self.is_terminal() {
            Some(FlowOutcome::Failed)
        } else {
            None
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn initial_state() -> FlowState {
    FlowState::Start
}

// ---------------------------------------------------------------------------
// IllegalStep
// ---------------------------------------------------------------------------

/// A step name that is not legal from the given state under the grant's
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalStep {
    pub grant_type: GrantType,
    pub from: FlowState,
    pub step: String,
}

impl fmt::Display for IllegalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step `{}` is not legal from state `{}` in grant `{}`",
            self.step, self.from, self.grant_type
        )
    }
}

impl std::error::Error for IllegalStep {}

// ---------------------------------------------------------------------------
// Transition functions
// ---------------------------------------------------------------------------

type Params = BTreeMap<String, String>;

/// Apply one step to a state under the grant's machine.
///
/// Response steps are classified by their params: a success token takes the
/// success branch, a recognized `error` code takes its named terminal, and
/// anything else lands in the grant's fallback. The step itself is not
/// validated here beyond machine legality; conformance rules judge the rest.
pub fn transition(
    grant_type: GrantType,
    from: FlowState,
    step: &str,
    params: &Params,
) -> Result<FlowState, IllegalStep> {
    let illegal = || IllegalStep {
        grant_type,
        from,
        step: step.to_string(),
    };
    if from.is_terminal() {
        return Err(illegal());
    }
    let next = match grant_type {
        GrantType::Implicit => implicit_transition(from, step, params),
        GrantType::DeviceCode => device_transition(from, step, params),
        GrantType::ClientCredentials => client_credentials_transition(from, step, params),
        GrantType::AuthorizationCodePkce => authorization_code_transition(from, step, params),
    };
    next.ok_or_else(illegal)
}

fn implicit_transition(from: FlowState, step: &str, params: &Params) -> Option<FlowState> {
    match (from, step) {
        (FlowState::Start, step::AUTHORIZATION_REQUEST) => Some(FlowState::AuthorizationRequested),
        (FlowState::AuthorizationRequested, step::FRAGMENT_RESPONSE) => {
            if params.contains_key(wire::param::ERROR) {
                Some(FlowState::ErrorReceived)
            } else if params.contains_key(wire::param::ACCESS_TOKEN)
                && params.contains_key(wire::param::TOKEN_TYPE)
            {
                Some(FlowState::Succeeded)
            } else {
                // Callback arrived but the token is incomplete; rules flag it.
                Some(FlowState::TokenInFragmentReceived)
            }
        }
        _ => None,
    }
}

fn device_transition(from: FlowState, step: &str, params: &Params) -> Option<FlowState> {
    match (from, step) {
        (FlowState::Start, step::DEVICE_AUTHORIZATION_REQUEST) => {
            Some(FlowState::DeviceAuthorizationRequested)
        }
        (FlowState::DeviceAuthorizationRequested, step::DEVICE_AUTHORIZATION_RESPONSE) => {
            Some(FlowState::DeviceAuthorizationResponded)
        }
        (FlowState::DeviceAuthorizationResponded | FlowState::Polling, step::TOKEN_POLL) => {
            Some(FlowState::Polling)
        }
        (FlowState::Polling, step::TOKEN_POLL_RESPONSE) => {
            if params.contains_key(wire::param::ACCESS_TOKEN) {
                Some(FlowState::Succeeded)
            } else {
                match params.get(wire::param::ERROR).map(String::as_str) {
                    Some(wire::ERROR_AUTHORIZATION_PENDING) | Some(wire::ERROR_SLOW_DOWN) => {
                        Some(FlowState::Polling)
                    }
                    Some(wire::ERROR_ACCESS_DENIED) => Some(FlowState::AccessDenied),
                    Some(wire::ERROR_EXPIRED_TOKEN) => Some(FlowState::ExpiredToken),
                    _ => Some(FlowState::OtherError),
                }
            }
        }
        _ => None,
    }
}

fn client_credentials_transition(from: FlowState, step: &str, params: &Params) -> Option<FlowState> {
    match (from, step) {
        (FlowState::Start, step::TOKEN_REQUEST) => Some(FlowState::TokenRequested),
        (FlowState::TokenRequested, step::TOKEN_RESPONSE) => {
            if params.contains_key(wire::param::ACCESS_TOKEN) {
                Some(FlowState::Succeeded)
            } else {
                match params.get(wire::param::ERROR).map(String::as_str) {
                    Some(wire::ERROR_INVALID_CLIENT) => Some(FlowState::InvalidClient),
                    Some(wire::ERROR_INVALID_SCOPE) => Some(FlowState::InvalidScope),
                    Some(wire::ERROR_UNAUTHORIZED_CLIENT) => Some(FlowState::UnauthorizedClient),
                    // Unexpected error codes terminate rather than wedge.
                    _ => Some(FlowState::OtherError),
                }
            }
        }
        _ => None,
    }
}

fn authorization_code_transition(from: FlowState, step: &str, params: &Params) -> Option<FlowState> {
    match (from, step) {
        (FlowState::Start, step::AUTHORIZATION_REQUEST) => Some(FlowState::AuthorizationRequested),
        (FlowState::AuthorizationRequested, step::USER_AUTHENTICATION) => {
            Some(FlowState::UserAuthenticated)
        }
        (FlowState::UserAuthenticated, step::AUTHORIZATION_RESPONSE) => {
            if params.contains_key(wire::param::ERROR) {
                Some(FlowState::ErrorReceived)
            } else {
                Some(FlowState::AuthorizationResponded)
            }
        }
        // Self-loop: exchange retries and replays are recordable facts; the
        // single-use rules judge them.
        (FlowState::AuthorizationResponded | FlowState::TokenRequested, step::TOKEN_REQUEST) => {
            Some(FlowState::TokenRequested)
        }
        (FlowState::TokenRequested, step::TOKEN_RESPONSE) => {
            if params.contains_key(wire::param::ACCESS_TOKEN) {
                Some(FlowState::Succeeded)
            } else {
                match params.get(wire::param::ERROR).map(String::as_str) {
                    Some(wire::ERROR_INVALID_GRANT) => Some(FlowState::InvalidGrant),
                    _ => Some(FlowState::OtherError),
                }
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Fold recorded steps into a derived state. Illegal steps are skipped (the
/// state does not move), so the result is the state after the longest legal
/// prefix interleaving.
pub fn replay(grant_type: GrantType, steps: &[StepRecord]) -> FlowState {
    let mut state = initial_state();
    for record in steps {
        if let Ok(next) = transition(grant_type, state, record.name(), record.params()) {
            state = next;
        }
    }
    state
}

/// Strict replay: fails on the first step that is not legal from the state
/// reached so far. Backs the legal-sequence conformance rule.
pub fn verify_sequence(grant_type: GrantType, steps: &[StepRecord]) -> Result<FlowState, IllegalStep> {
    let mut state = initial_state();
    for record in steps {
        state = transition(grant_type, state, record.name(), record.params())?;
    }
    Ok(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
