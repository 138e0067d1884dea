//! Device-authorization-grant rules (RFC 8628).
//!
//! The backoff rule is the algorithmic heart: it replays the poll timeline
//! against the declared interval, raising the required gap by five seconds
//! every time the server answered `slow_down`, so both an early poll and a
//! client that ignored `slow_down` surface as the same violation.

use chrono::{DateTime, Duration, Utc};

use crate::config::EngineConfig;
use crate::grant::GrantType;
use crate::rule::{Rule, RuleOutcome, Severity};
use crate::state_machine::step;
use crate::wire;

pub const DEV_AUTHZ_RESPONSE_SHAPE: &str = "DEV-AUTHZ-RESPONSE-SHAPE";
pub const DEV_BACKOFF: &str = "DEV-BACKOFF";
pub const DEV_POLL_SHAPE: &str = "DEV-POLL-SHAPE";
pub const DEV_USER_CODE_QUALITY: &str = "DEV-USER-CODE-QUALITY";
pub const DEV_CODE_EXPIRED: &str = "DEV-CODE-EXPIRED";

/// RFC 8628 section 3.5: `slow_down` raises the minimum interval by 5s.
const SLOW_DOWN_INCREMENT_SECS: i64 = 5;

pub fn rules(config: &EngineConfig) -> Vec<Rule> {
    vec![
        authz_response_shape(),
        user_code_quality(config),
        poll_shape(),
        backoff(config),
        code_expired(),
    ]
}

// ---------------------------------------------------------------------------
// Device authorization response
// ---------------------------------------------------------------------------

fn authz_response_shape() -> Rule {
    Rule::new(
        DEV_AUTHZ_RESPONSE_SHAPE,
        [GrantType::DeviceCode],
        "RFC 8628 section 3.2",
        Severity::High,
        |session| {
            let Ok(response) = session.get_step(step::DEVICE_AUTHORIZATION_RESPONSE) else {
                return RuleOutcome::NotApplicable;
            };
            if response.has_param(wire::param::ERROR) {
                return RuleOutcome::NotApplicable;
            }
            let missing: Vec<&str> = [
                wire::param::DEVICE_CODE,
                wire::param::USER_CODE,
                wire::param::VERIFICATION_URI,
                wire::param::EXPIRES_IN,
            ]
            .into_iter()
            .filter(|key| !response.has_param(key))
            .collect();
            if missing.is_empty() {
                RuleOutcome::Pass
            } else {
                RuleOutcome::fail_at(
                    format!(
                        "device authorization response omits required fields: {}",
                        missing.join(", ")
                    ),
                    [step::DEVICE_AUTHORIZATION_RESPONSE],
                )
            }
        },
    )
    .trigger_on([step::DEVICE_AUTHORIZATION_RESPONSE])
}

fn user_code_quality(config: &EngineConfig) -> Rule {
    let min_millibits = config.min_user_code_entropy_millibits;
    Rule::new(
        DEV_USER_CODE_QUALITY,
        [GrantType::DeviceCode],
        "RFC 8628 section 6.1",
        Severity::Low,
        move |session| {
            let Some(code) = super::step_param(
                session,
                step::DEVICE_AUTHORIZATION_RESPONSE,
                wire::param::USER_CODE,
            ) else {
                return RuleOutcome::NotApplicable;
            };
            if let Some(bad) = code
                .bytes()
                .find(|b| !(b.is_ascii_alphanumeric() || *b == b'-'))
            {
                return RuleOutcome::fail_at(
                    format!(
                        "user code contains `{}`, outside the transcribable \
                         alphanumeric-plus-separator set",
                        bad as char
                    ),
                    [step::DEVICE_AUTHORIZATION_RESPONSE],
                );
            }
            let estimate = crate::entropy::estimated_millibits(code);
            if estimate < min_millibits {
                return RuleOutcome::fail_at(
                    format!(
                        "user code estimates {estimate} millibits of entropy, \
                         below the {min_millibits} floor"
                    ),
                    [step::DEVICE_AUTHORIZATION_RESPONSE],
                );
            }
            RuleOutcome::Pass
        },
    )
    .trigger_on([step::DEVICE_AUTHORIZATION_RESPONSE])
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

fn poll_shape() -> Rule {
    Rule::new(
        DEV_POLL_SHAPE,
        [GrantType::DeviceCode],
        "RFC 8628 section 3.4",
        Severity::High,
        |session| {
            let mut saw_poll = false;
            for poll in session.steps_named(step::TOKEN_POLL) {
                saw_poll = true;
                if poll.param(wire::param::GRANT_TYPE) != Some(wire::DEVICE_GRANT_TYPE_URN) {
                    return RuleOutcome::fail_at(
                        format!(
                            "token poll must declare grant_type `{}`",
                            wire::DEVICE_GRANT_TYPE_URN
                        ),
                        [step::TOKEN_POLL],
                    );
                }
                if !poll.has_param(wire::param::DEVICE_CODE) {
                    return RuleOutcome::fail_at(
                        "token poll omits the device_code it is polling for",
                        [step::TOKEN_POLL],
                    );
                }
            }
            if saw_poll {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([step::TOKEN_POLL])
}

fn backoff(config: &EngineConfig) -> Rule {
    let default_interval = config.default_poll_interval_secs;
    Rule::new(
        DEV_BACKOFF,
        [GrantType::DeviceCode],
        "RFC 8628 section 3.5",
        Severity::High,
        move |session| {
            let declared = super::step_param(
                session,
                step::DEVICE_AUTHORIZATION_RESPONSE,
                wire::param::INTERVAL,
            )
            .and_then(wire::parse_seconds)
            .unwrap_or(default_interval);

            let mut required = declared;
            let mut last_poll: Option<DateTime<Utc>> = None;
            let mut polls = 0usize;

            for record in session.steps() {
                match record.name() {
                    step::TOKEN_POLL => {
                        polls += 1;
                        if let Some(previous) = last_poll {
                            let gap = (record.observed_at() - previous).num_seconds();
                            if gap < required {
                                return RuleOutcome::fail_at(
                                    format!(
                                        "poll #{polls} arrived {gap}s after the previous poll; \
                                         the required interval was {required}s"
                                    ),
                                    [step::TOKEN_POLL],
                                );
                            }
                        }
                        last_poll = Some(record.observed_at());
                    }
                    step::TOKEN_POLL_RESPONSE => {
                        if record.param(wire::param::ERROR) == Some(wire::ERROR_SLOW_DOWN) {
                            required += SLOW_DOWN_INCREMENT_SECS;
                        }
                    }
                    _ => {}
                }
            }

            if polls >= 2 {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([step::TOKEN_POLL, step::TOKEN_POLL_RESPONSE])
}

fn code_expired() -> Rule {
    Rule::new(
        DEV_CODE_EXPIRED,
        [GrantType::DeviceCode],
        "RFC 8628 section 3.5",
        Severity::Medium,
        |session| {
            let Ok(response) = session.get_step(step::DEVICE_AUTHORIZATION_RESPONSE) else {
                return RuleOutcome::NotApplicable;
            };
            let Some(expires_in) = response
                .param(wire::param::EXPIRES_IN)
                .and_then(wire::parse_seconds)
            else {
                return RuleOutcome::NotApplicable;
            };
            let deadline = response.observed_at() + Duration::seconds(expires_in);

            let mut saw_poll = false;
            for (index, poll) in session.steps_named(step::TOKEN_POLL).enumerate() {
                saw_poll = true;
                if poll.observed_at() > deadline {
                    return RuleOutcome::fail_at(
                        format!(
                            "poll #{} continued {}s past device code expiry",
                            index + 1,
                            (poll.observed_at() - deadline).num_seconds()
                        ),
                        [step::TOKEN_POLL],
                    );
                }
            }
            if saw_poll {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([step::TOKEN_POLL])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
