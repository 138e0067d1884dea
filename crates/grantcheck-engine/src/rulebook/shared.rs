//! Rules that apply across grant types, parameterized by grant set.

use subtle::ConstantTimeEq;

use crate::config::EngineConfig;
use crate::entropy;
use crate::grant::GrantType;
use crate::rule::{Rule, RuleOutcome, Severity};
use crate::session::{Direction, TransportScheme};
use crate::state_machine::{self, step};
use crate::wire;

pub const SH_HTTPS_ONLY: &str = "SH-HTTPS-ONLY";
pub const SH_LEGAL_SEQUENCE: &str = "SH-LEGAL-SEQUENCE";
pub const SH_TOKEN_SHAPE: &str = "SH-TOKEN-SHAPE";
pub const SH_EXPIRES_IN: &str = "SH-EXPIRES-IN";
pub const SH_ERROR_CODE_REGISTERED: &str = "SH-ERROR-CODE-REGISTERED";
pub const SH_STATUS_MAPPING: &str = "SH-STATUS-MAPPING";
pub const SH_SCOPE_WIDENING: &str = "SH-SCOPE-WIDENING";
pub const SH_STATE_PRESENT: &str = "SH-STATE-PRESENT";
pub const SH_STATE_ECHO: &str = "SH-STATE-ECHO";
pub const SH_STATE_ENTROPY: &str = "SH-STATE-ENTROPY";

/// Grants whose flows run through a front-channel redirect and carry
/// `state`.
const REDIRECT_GRANTS: [GrantType; 2] = [GrantType::Implicit, GrantType::AuthorizationCodePkce];

/// Front-channel callback step of a redirect grant.
fn callback_step(grant_type: GrantType) -> Option<&'static str> {
    match grant_type {
        GrantType::Implicit => Some(step::FRAGMENT_RESPONSE),
        GrantType::AuthorizationCodePkce => Some(step::AUTHORIZATION_RESPONSE),
        GrantType::DeviceCode | GrantType::ClientCredentials => None,
    }
}

pub fn rules(config: &EngineConfig) -> Vec<Rule> {
    vec![
        https_only(),
        legal_sequence(),
        token_shape(),
        expires_in_recommended(),
        error_code_registered(),
        status_mapping(),
        scope_widening(),
        state_present(),
        state_echo(),
        state_entropy(config),
    ]
}

// ---------------------------------------------------------------------------
// Transport and sequence
// ---------------------------------------------------------------------------

fn https_only() -> Rule {
    Rule::new(
        SH_HTTPS_ONLY,
        GrantType::ALL,
        "RFC 6749 section 10.9",
        Severity::Critical,
        |session| {
            match session
                .steps()
                .iter()
                .find(|s| s.scheme() == TransportScheme::Http)
            {
                Some(step) => RuleOutcome::fail_at(
                    format!("step `{}` was exchanged over plain http", step.name()),
                    [step.name()],
                ),
                None if session.steps().is_empty() => RuleOutcome::NotApplicable,
                None => RuleOutcome::Pass,
            }
        },
    )
}

fn legal_sequence() -> Rule {
    Rule::new(
        SH_LEGAL_SEQUENCE,
        GrantType::ALL,
        "RFC 6749 section 4",
        Severity::High,
        |session| {
            if session.steps().is_empty() {
                return RuleOutcome::NotApplicable;
            }
            match state_machine::verify_sequence(session.grant_type(), session.steps()) {
                Ok(_) => RuleOutcome::Pass,
                Err(err) => RuleOutcome::fail_at(
                    format!("invalid_request: {err}"),
                    [err.step.clone()],
                ),
            }
        },
    )
}

// ---------------------------------------------------------------------------
// Token response shape
// ---------------------------------------------------------------------------

fn token_shape() -> Rule {
    Rule::new(
        SH_TOKEN_SHAPE,
        GrantType::ALL,
        "RFC 6749 section 5.1",
        Severity::High,
        |session| {
            let mut saw_token = false;
            for step in session.steps() {
                if step.direction() != Direction::ServerToClient
                    || !step.has_param(wire::param::ACCESS_TOKEN)
                {
                    continue;
                }
                saw_token = true;
                if !step.has_param(wire::param::TOKEN_TYPE) {
                    return RuleOutcome::fail_at(
                        format!(
                            "step `{}` issued an access token without the required token_type",
                            step.name()
                        ),
                        [step.name()],
                    );
                }
            }
            if saw_token {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([
        step::FRAGMENT_RESPONSE,
        step::TOKEN_RESPONSE,
        step::TOKEN_POLL_RESPONSE,
    ])
}

fn expires_in_recommended() -> Rule {
    Rule::new(
        SH_EXPIRES_IN,
        GrantType::ALL,
        "RFC 6749 section 5.1",
        Severity::Low,
        |session| {
            let mut saw_token = false;
            for step in session.steps() {
                if step.direction() != Direction::ServerToClient
                    || !step.has_param(wire::param::ACCESS_TOKEN)
                {
                    continue;
                }
                saw_token = true;
                if !step.has_param(wire::param::EXPIRES_IN) {
                    return RuleOutcome::fail_at(
                        format!(
                            "step `{}` issued an access token without an expires_in lifetime",
                            step.name()
                        ),
                        [step.name()],
                    );
                }
            }
            if saw_token {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([
        step::FRAGMENT_RESPONSE,
        step::TOKEN_RESPONSE,
        step::TOKEN_POLL_RESPONSE,
    ])
}

// ---------------------------------------------------------------------------
// Error vocabulary and status mapping
// ---------------------------------------------------------------------------

fn error_code_registered() -> Rule {
    Rule::new(
        SH_ERROR_CODE_REGISTERED,
        GrantType::ALL,
        "RFC 6749 section 5.2",
        Severity::Medium,
        |session| {
            let mut saw_error = false;
            for step in session.steps() {
                let Some(code) = step.param(wire::param::ERROR) else {
                    continue;
                };
                saw_error = true;
                if !wire::is_registered_error(code) {
                    return RuleOutcome::fail_at(
                        format!(
                            "step `{}` carries unregistered error code `{code}`",
                            step.name()
                        ),
                        [step.name()],
                    );
                }
            }
            if saw_error {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([
        step::FRAGMENT_RESPONSE,
        step::AUTHORIZATION_RESPONSE,
        step::TOKEN_RESPONSE,
        step::TOKEN_POLL_RESPONSE,
        step::DEVICE_AUTHORIZATION_RESPONSE,
    ])
}

/// Expected HTTP status of a captured server response step, when one can be
/// derived from the step's own facts.
fn expected_status(step_name: &str, step: &crate::session::StepRecord) -> Option<u16> {
    match step_name {
        // Front-channel answers travel as redirects, errors included.
        step::FRAGMENT_RESPONSE | step::AUTHORIZATION_RESPONSE => Some(wire::REDIRECT_STATUS),
        step::TOKEN_RESPONSE | step::TOKEN_POLL_RESPONSE | step::DEVICE_AUTHORIZATION_RESPONSE => {
            if let Some(code) = step.param(wire::param::ERROR) {
                wire::is_registered_error(code).then(|| wire::expected_error_status(code))
            } else if step.has_param(wire::param::ACCESS_TOKEN)
                || step.has_param(wire::param::DEVICE_CODE)
            {
                Some(200)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn status_mapping() -> Rule {
    Rule::new(
        SH_STATUS_MAPPING,
        GrantType::ALL,
        "RFC 6749 section 5.2",
        Severity::Medium,
        |session| {
            let mut checked = false;
            for step in session.steps() {
                if step.direction() != Direction::ServerToClient {
                    continue;
                }
                let Some(raw) = step.param(wire::param::STATUS) else {
                    continue;
                };
                let Some(want) = expected_status(step.name(), step) else {
                    continue;
                };
                checked = true;
                match wire::parse_status(raw) {
                    None => {
                        return RuleOutcome::fail_at(
                            format!("step `{}` captured unparseable status `{raw}`", step.name()),
                            [step.name()],
                        )
                    }
                    Some(got) if got != want => {
                        return RuleOutcome::fail_at(
                            format!(
                                "step `{}` returned status {got}, expected {want}",
                                step.name()
                            ),
                            [step.name()],
                        )
                    }
                    Some(_) => {}
                }
            }
            if checked {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([
        step::FRAGMENT_RESPONSE,
        step::AUTHORIZATION_RESPONSE,
        step::TOKEN_RESPONSE,
        step::TOKEN_POLL_RESPONSE,
        step::DEVICE_AUTHORIZATION_RESPONSE,
    ])
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

fn scope_widening() -> Rule {
    Rule::new(
        SH_SCOPE_WIDENING,
        GrantType::ALL,
        "RFC 6749 section 3.3",
        Severity::High,
        |session| {
            let requested = session
                .steps()
                .iter()
                .find(|s| {
                    s.direction() == Direction::ClientToServer && s.has_param(wire::param::SCOPE)
                })
                .and_then(|s| s.param(wire::param::SCOPE));
            let Some(requested) = requested else {
                return RuleOutcome::NotApplicable;
            };
            let requested = wire::split_scope(requested);

            for step in session.steps() {
                if step.direction() != Direction::ServerToClient {
                    continue;
                }
                let Some(granted) = step.param(wire::param::SCOPE) else {
                    continue;
                };
                let widened: Vec<&str> = wire::split_scope(granted)
                    .into_iter()
                    .filter(|scope| !requested.contains(scope))
                    .collect();
                if !widened.is_empty() {
                    return RuleOutcome::fail_at(
                        format!(
                            "step `{}` granted scopes never requested: {}",
                            step.name(),
                            widened.join(" ")
                        ),
                        [step.name()],
                    );
                }
            }
            RuleOutcome::Pass
        },
    )
    .trigger_on([
        step::FRAGMENT_RESPONSE,
        step::TOKEN_RESPONSE,
        step::TOKEN_POLL_RESPONSE,
    ])
}

// ---------------------------------------------------------------------------
// State binding
// ---------------------------------------------------------------------------

fn state_present() -> Rule {
    Rule::new(
        SH_STATE_PRESENT,
        REDIRECT_GRANTS,
        "RFC 6749 section 10.12",
        Severity::Medium,
        |session| {
            let Ok(request) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            if request.has_param(wire::param::STATE) {
                RuleOutcome::Pass
            } else {
                RuleOutcome::fail_at(
                    "authorization request carries no state value to bind the callback",
                    [step::AUTHORIZATION_REQUEST],
                )
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

fn state_echo() -> Rule {
    Rule::new(
        SH_STATE_ECHO,
        REDIRECT_GRANTS,
        "RFC 6749 section 10.12",
        Severity::Critical,
        |session| {
            let Some(sent) = super::step_param(session, step::AUTHORIZATION_REQUEST, wire::param::STATE)
            else {
                return RuleOutcome::NotApplicable;
            };
            let Some(callback) = callback_step(session.grant_type()) else {
                return RuleOutcome::NotApplicable;
            };
            let Ok(response) = session.get_step(callback) else {
                return RuleOutcome::NotApplicable;
            };
            match response.param(wire::param::STATE) {
                None => RuleOutcome::fail_at(
                    format!("callback `{callback}` omitted the state echo"),
                    [callback],
                ),
                Some(echoed) if bool::from(echoed.as_bytes().ct_eq(sent.as_bytes())) => {
                    RuleOutcome::Pass
                }
                Some(_) => RuleOutcome::fail_at(
                    format!(
                        "state echoed on `{callback}` does not byte-match the value sent; \
                         possible CSRF or session swap"
                    ),
                    [step::AUTHORIZATION_REQUEST, callback],
                ),
            }
        },
    )
    .trigger_on([step::FRAGMENT_RESPONSE, step::AUTHORIZATION_RESPONSE])
}

fn state_entropy(config: &EngineConfig) -> Rule {
    let min_len = config.min_state_length;
    let min_millibits = config.min_state_entropy_millibits;
    Rule::new(
        SH_STATE_ENTROPY,
        REDIRECT_GRANTS,
        "RFC 6749 section 10.10",
        Severity::Low,
        move |session| {
            let Some(state) =
                super::step_param(session, step::AUTHORIZATION_REQUEST, wire::param::STATE)
            else {
                return RuleOutcome::NotApplicable;
            };
            if state.len() < min_len {
                return RuleOutcome::fail_at(
                    format!(
                        "state value is {} chars, below the {min_len}-char floor",
                        state.len()
                    ),
                    [step::AUTHORIZATION_REQUEST],
                );
            }
            let estimate = entropy::estimated_millibits(state);
            if estimate < min_millibits {
                return RuleOutcome::fail_at(
                    format!(
                        "state value estimates {estimate} millibits of entropy, \
                         below the {min_millibits} floor"
                    ),
                    [step::AUTHORIZATION_REQUEST],
                );
            }
            RuleOutcome::Pass
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
