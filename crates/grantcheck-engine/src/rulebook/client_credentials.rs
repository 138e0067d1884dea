//! Client-credentials-grant rules (RFC 6749 section 4.4, RFC 7523).
//!
//! A single back-channel round trip by a confidential client. The rules
//! center on client authentication: the grant has no user, so the client
//! credential is the only thing standing between the token and anyone.

use crate::config::EngineConfig;
use crate::grant::GrantType;
use crate::rule::{Rule, RuleOutcome, Severity};
use crate::state_machine::step;
use crate::wire;

pub const CC_GRANT_TYPE: &str = "CC-GRANT-TYPE";
pub const CC_CLIENT_AUTH: &str = "CC-CLIENT-AUTH";
pub const CC_ASSERTION_TYPE: &str = "CC-ASSERTION-TYPE";
pub const CC_NO_REFRESH_TOKEN: &str = "CC-NO-REFRESH-TOKEN";

pub fn rules(_config: &EngineConfig) -> Vec<Rule> {
    vec![
        grant_type_value(),
        client_auth(),
        assertion_type(),
        no_refresh_token(),
    ]
}

fn grant_type_value() -> Rule {
    Rule::new(
        CC_GRANT_TYPE,
        [GrantType::ClientCredentials],
        "RFC 6749 section 4.4.2",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::TOKEN_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            match request.param(wire::param::GRANT_TYPE) {
                Some(wire::CLIENT_CREDENTIALS_GRANT_TYPE) => RuleOutcome::Pass,
                Some(other) => RuleOutcome::fail_at(
                    format!(
                        "grant_type is `{other}`, required value is `{}`",
                        wire::CLIENT_CREDENTIALS_GRANT_TYPE
                    ),
                    [step::TOKEN_REQUEST],
                ),
                None => RuleOutcome::fail_at(
                    "token request omits the required grant_type",
                    [step::TOKEN_REQUEST],
                ),
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn client_auth() -> Rule {
    Rule::new(
        CC_CLIENT_AUTH,
        [GrantType::ClientCredentials],
        "RFC 6749 section 4.4.2",
        Severity::Critical,
        |session| {
            let Ok(request) = session.get_step(step::TOKEN_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            if request.has_param(wire::param::CLIENT_SECRET)
                || request.has_param(wire::param::CLIENT_ASSERTION)
            {
                RuleOutcome::Pass
            } else {
                RuleOutcome::fail_at(
                    "token request carries no client authentication; the grant is \
                     restricted to authenticated confidential clients",
                    [step::TOKEN_REQUEST],
                )
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn assertion_type() -> Rule {
    Rule::new(
        CC_ASSERTION_TYPE,
        [GrantType::ClientCredentials],
        "RFC 7523 section 2.2",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::TOKEN_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            if !request.has_param(wire::param::CLIENT_ASSERTION) {
                return RuleOutcome::NotApplicable;
            }
            match request.param(wire::param::CLIENT_ASSERTION_TYPE) {
                Some(wire::JWT_BEARER_ASSERTION_TYPE) => RuleOutcome::Pass,
                Some(other) => RuleOutcome::fail_at(
                    format!("client_assertion_type is `{other}`, expected the JWT bearer URN"),
                    [step::TOKEN_REQUEST],
                ),
                None => RuleOutcome::fail_at(
                    "client_assertion sent without its client_assertion_type",
                    [step::TOKEN_REQUEST],
                ),
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn no_refresh_token() -> Rule {
    Rule::new(
        CC_NO_REFRESH_TOKEN,
        [GrantType::ClientCredentials],
        "RFC 6749 section 4.4.3",
        Severity::Medium,
        |session| {
            let Ok(response) = session.get_step(step::TOKEN_RESPONSE) else {
                return RuleOutcome::NotApplicable;
            };
            if response.has_param(wire::param::REFRESH_TOKEN) {
                RuleOutcome::fail_at(
                    "refresh token issued to a client-credentials client, which can \
                     simply re-authenticate instead",
                    [step::TOKEN_RESPONSE],
                )
            } else {
                RuleOutcome::Pass
            }
        },
    )
    .trigger_on([step::TOKEN_RESPONSE])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Direction, FlowSession, TransportScheme};
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rule(id: &str) -> Rule {
        rules(&EngineConfig::default())
            .into_iter()
            .find(|r| r.id() == id)
            .unwrap()
    }

    fn session_with_request(params: &[(&str, &str)]) -> FlowSession {
        let mut s = FlowSession::new(GrantType::ClientCredentials, t(0));
        s.record_step(
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            TransportScheme::Https,
            params.iter().copied(),
            t(1),
        )
        .unwrap();
        s
    }

    #[test]
    fn secret_authenticated_request_passes() {
        let s = session_with_request(&[
            ("grant_type", "client_credentials"),
            ("client_id", "service-a"),
            ("client_secret", "s3cr3t"),
        ]);
        assert_eq!(rule(CC_GRANT_TYPE).evaluate(&s), RuleOutcome::Pass);
        assert_eq!(rule(CC_CLIENT_AUTH).evaluate(&s), RuleOutcome::Pass);
        assert_eq!(rule(CC_ASSERTION_TYPE).evaluate(&s), RuleOutcome::NotApplicable);
    }

    #[test]
    fn unauthenticated_request_is_critical() {
        let s = session_with_request(&[("grant_type", "client_credentials")]);
        let auth = rule(CC_CLIENT_AUTH);
        assert_eq!(auth.severity(), Severity::Critical);
        assert!(auth.evaluate(&s).is_fail());
    }

    #[test]
    fn assertion_requires_the_jwt_bearer_urn() {
        let missing_type = session_with_request(&[
            ("grant_type", "client_credentials"),
            ("client_assertion", "eyJhbGciOi..."),
        ]);
        assert!(rule(CC_ASSERTION_TYPE).evaluate(&missing_type).is_fail());

        let with_urn = session_with_request(&[
            ("grant_type", "client_credentials"),
            ("client_assertion", "eyJhbGciOi..."),
            ("client_assertion_type", wire::JWT_BEARER_ASSERTION_TYPE),
        ]);
        assert_eq!(rule(CC_ASSERTION_TYPE).evaluate(&with_urn), RuleOutcome::Pass);
    }

    #[test]
    fn wrong_grant_type_names_the_required_value() {
        let s = session_with_request(&[("grant_type", "password"), ("client_secret", "s")]);
        match rule(CC_GRANT_TYPE).evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("client_credentials")),
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[test]
    fn refresh_token_in_response_is_flagged() {
        let mut s = session_with_request(&[
            ("grant_type", "client_credentials"),
            ("client_secret", "s3cr3t"),
        ]);
        s.record_step(
            step::TOKEN_RESPONSE,
            Direction::ServerToClient,
            TransportScheme::Https,
            [
                ("access_token", "tok"),
                ("token_type", "Bearer"),
                ("refresh_token", "rt-1"),
            ],
            t(2),
        )
        .unwrap();
        assert!(rule(CC_NO_REFRESH_TOKEN).evaluate(&s).is_fail());
    }
}
