//! Implicit-grant rules.
//!
//! The flow has no token endpoint at all: the token rides the redirect
//! fragment. Beyond the shared redirect-grant rules, the flow itself is
//! flagged as deprecated, and two fragment obligations are checked.

use crate::config::EngineConfig;
use crate::grant::GrantType;
use crate::rule::{Rule, RuleOutcome, Severity};
use crate::state_machine::step;
use crate::wire;

pub const IM_DEPRECATED_GRANT: &str = "IM-DEPRECATED-GRANT";
pub const IM_RESPONSE_TYPE: &str = "IM-RESPONSE-TYPE";
pub const IM_NO_REFRESH_TOKEN: &str = "IM-NO-REFRESH-TOKEN";

pub fn rules(_config: &EngineConfig) -> Vec<Rule> {
    vec![deprecated_grant(), response_type(), no_refresh_token()]
}

/// Every observed implicit flow is itself a finding: the grant carries the
/// token through the front channel and cannot be sender-constrained.
fn deprecated_grant() -> Rule {
    Rule::new(
        IM_DEPRECATED_GRANT,
        [GrantType::Implicit],
        "OAuth 2.0 Security BCP section 2.1.2",
        Severity::High,
        |session| {
            if session.steps().is_empty() {
                RuleOutcome::NotApplicable
            } else {
                RuleOutcome::fail_at(
                    "implicit grant observed; tokens in the fragment are exposed to \
                     scripts and history, migrate to authorization code with PKCE",
                    [step::AUTHORIZATION_REQUEST],
                )
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

fn response_type() -> Rule {
    Rule::new(
        IM_RESPONSE_TYPE,
        [GrantType::Implicit],
        "RFC 6749 section 4.2.1",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            match request.param(wire::param::RESPONSE_TYPE) {
                Some("token") => RuleOutcome::Pass,
                Some(other) => RuleOutcome::fail_at(
                    format!("response_type is `{other}`, required value is `token`"),
                    [step::AUTHORIZATION_REQUEST],
                ),
                None => RuleOutcome::fail_at(
                    "authorization request omits the required response_type",
                    [step::AUTHORIZATION_REQUEST],
                ),
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

fn no_refresh_token() -> Rule {
    Rule::new(
        IM_NO_REFRESH_TOKEN,
        [GrantType::Implicit],
        "RFC 6749 section 4.2.2",
        Severity::Critical,
        |session| {
            let Ok(fragment) = session.get_step(step::FRAGMENT_RESPONSE) else {
                return RuleOutcome::NotApplicable;
            };
            if fragment.has_param(wire::param::REFRESH_TOKEN) {
                RuleOutcome::fail_at(
                    "refresh token issued into the redirect fragment; the implicit \
                     grant must never issue one",
                    [step::FRAGMENT_RESPONSE],
                )
            } else {
                RuleOutcome::Pass
            }
        },
    )
    .trigger_on([step::FRAGMENT_RESPONSE])
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

    fn session_with_fragment(extra: &[(&str, &str)]) -> FlowSession {
        let mut s = FlowSession::new(GrantType::Implicit, t(0));
        s.record_step(
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            TransportScheme::Https,
            [("response_type", "token"), ("state", "n-0S6_WzA2Mj")],
            t(1),
        )
        .unwrap();
        let mut params = vec![("access_token", "tok"), ("token_type", "Bearer")];
        params.extend_from_slice(extra);
        s.record_step(
            step::FRAGMENT_RESPONSE,
            Direction::ServerToClient,
            TransportScheme::Https,
            params,
            t(2),
        )
        .unwrap();
        s
    }

    #[test]
    fn any_started_implicit_flow_is_flagged_deprecated() {
        let s = session_with_fragment(&[]);
        assert!(rule(IM_DEPRECATED_GRANT).evaluate(&s).is_fail());

        let empty = FlowSession::new(GrantType::Implicit, t(0));
        assert_eq!(
            rule(IM_DEPRECATED_GRANT).evaluate(&empty),
            RuleOutcome::NotApplicable
        );
    }

    #[test]
    fn wrong_response_type_fails() {
        let mut s = FlowSession::new(GrantType::Implicit, t(0));
        s.record_step(
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            TransportScheme::Https,
            [("response_type", "code")],
            t(1),
        )
        .unwrap();
        match rule(IM_RESPONSE_TYPE).evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("`code`")),
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[test]
    fn refresh_token_in_fragment_is_critical() {
        let with_refresh = session_with_fragment(&[("refresh_token", "rt-1")]);
        assert!(rule(IM_NO_REFRESH_TOKEN).evaluate(&with_refresh).is_fail());

        let clean = session_with_fragment(&[]);
        assert_eq!(rule(IM_NO_REFRESH_TOKEN).evaluate(&clean), RuleOutcome::Pass);
    }
}
