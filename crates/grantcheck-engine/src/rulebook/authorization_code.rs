//! Authorization-code-with-PKCE rules (RFC 6749 section 4.1, RFC 7636).
//!
//! The PKCE chain is judged in layers so every defect gets its own
//! finding: the challenge must be pledged at all, the transform must be
//! a registered one, the verifier must be well formed, and the verifier
//! must recompute to the pledged challenge. A mismatch anywhere in the
//! last layer is the interception attack PKCE exists to stop.

use crate::config::EngineConfig;
use crate::grant::GrantType;
use crate::pkce::{self, CodeChallengeMethod};
use crate::rule::{Rule, RuleOutcome, Severity};
use crate::session::StepRecord;
use crate::state_machine::step;
use crate::wire;

pub const AC_RESPONSE_TYPE: &str = "AC-RESPONSE-TYPE";
pub const AC_PKCE_REQUIRED: &str = "AC-PKCE-REQUIRED";
pub const AC_PKCE_METHOD: &str = "AC-PKCE-METHOD";
pub const AC_PKCE_PLAIN: &str = "AC-PKCE-PLAIN";
pub const AC_VERIFIER_FORMAT: &str = "AC-VERIFIER-FORMAT";
pub const AC_PKCE_MATCH: &str = "AC-PKCE-MATCH";
pub const AC_REDIRECT_EXACT: &str = "AC-REDIRECT-EXACT";
pub const AC_CODE_REPLAY: &str = "AC-CODE-REPLAY";
pub const AC_CODE_REVOKE: &str = "AC-CODE-REVOKE";
pub const AC_CODE_LIFETIME: &str = "AC-CODE-LIFETIME";

/// The only `response_type` this grant may request.
const CODE_RESPONSE_TYPE: &str = "code";

pub fn rules(config: &EngineConfig) -> Vec<Rule> {
    vec![
        response_type(),
        pkce_required(),
        pkce_method(),
        pkce_plain(),
        verifier_format(),
        pkce_match(),
        redirect_exact(config),
        code_replay(),
        code_revoke(),
        code_lifetime(config),
    ]
}

/// The declared transform, defaulting to `plain` when the request names
/// none. `None` means a value was declared but is not a registered
/// transform; `AC-PKCE-METHOD` owns that finding.
fn declared_method(request: &StepRecord) -> Option<CodeChallengeMethod> {
    match request.param(wire::param::CODE_CHALLENGE_METHOD) {
        None => Some(CodeChallengeMethod::Plain),
        Some(raw) => CodeChallengeMethod::parse(raw),
    }
}

fn response_type() -> Rule {
    Rule::new(
        AC_RESPONSE_TYPE,
        [GrantType::AuthorizationCodePkce],
        "RFC 6749 section 4.1.1",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            match request.param(wire::param::RESPONSE_TYPE) {
                Some(CODE_RESPONSE_TYPE) => RuleOutcome::Pass,
                Some(other) => RuleOutcome::fail_at(
                    format!("response_type is `{other}`, required value is `{CODE_RESPONSE_TYPE}`"),
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

fn pkce_required() -> Rule {
    Rule::new(
        AC_PKCE_REQUIRED,
        [GrantType::AuthorizationCodePkce],
        "OAuth 2.0 Security BCP section 2.1.1",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            if request.has_param(wire::param::CODE_CHALLENGE) {
                RuleOutcome::Pass
            } else {
                RuleOutcome::fail_at(
                    "authorization request carries no code_challenge; the code is \
                     exposed to interception without PKCE",
                    [step::AUTHORIZATION_REQUEST],
                )
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

fn pkce_method() -> Rule {
    Rule::new(
        AC_PKCE_METHOD,
        [GrantType::AuthorizationCodePkce],
        "RFC 7636 section 4.3",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            // Omitting the parameter is legal and means `plain`.
            let Some(raw) = request.param(wire::param::CODE_CHALLENGE_METHOD) else {
                return RuleOutcome::NotApplicable;
            };
            if CodeChallengeMethod::parse(raw).is_some() {
                RuleOutcome::Pass
            } else {
                RuleOutcome::fail_at(
                    format!("code_challenge_method `{raw}` is not a registered transform"),
                    [step::AUTHORIZATION_REQUEST],
                )
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

fn pkce_plain() -> Rule {
    Rule::new(
        AC_PKCE_PLAIN,
        [GrantType::AuthorizationCodePkce],
        "RFC 7636 section 4.2",
        Severity::Medium,
        |session| {
            let Ok(request) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            if !request.has_param(wire::param::CODE_CHALLENGE) {
                return RuleOutcome::NotApplicable;
            }
            match declared_method(request) {
                Some(CodeChallengeMethod::Plain) => RuleOutcome::fail_at(
                    "code_challenge uses the plain transform, which discloses the \
                     verifier to anyone who saw the authorization request",
                    [step::AUTHORIZATION_REQUEST],
                ),
                Some(CodeChallengeMethod::S256) => RuleOutcome::Pass,
                None => RuleOutcome::NotApplicable,
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST])
}

fn verifier_format() -> Rule {
    Rule::new(
        AC_VERIFIER_FORMAT,
        [GrantType::AuthorizationCodePkce],
        "RFC 7636 section 4.1",
        Severity::High,
        |session| {
            let Ok(request) = session.get_step(step::TOKEN_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            let Some(verifier) = request.param(wire::param::CODE_VERIFIER) else {
                return RuleOutcome::NotApplicable;
            };
            match pkce::verifier_format_error(verifier) {
                None => RuleOutcome::Pass,
                Some(err) => RuleOutcome::fail_at(
                    format!("code_verifier is malformed: {err}"),
                    [step::TOKEN_REQUEST],
                ),
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn pkce_match() -> Rule {
    Rule::new(
        AC_PKCE_MATCH,
        [GrantType::AuthorizationCodePkce],
        "RFC 7636 section 4.6",
        Severity::Critical,
        |session| {
            let Ok(authz) = session.get_step(step::AUTHORIZATION_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            let Some(challenge) = authz.param(wire::param::CODE_CHALLENGE) else {
                return RuleOutcome::NotApplicable;
            };
            // An unregistered transform leaves nothing to recompute with.
            let Some(method) = declared_method(authz) else {
                return RuleOutcome::NotApplicable;
            };
            let Ok(exchange) = session.get_step(step::TOKEN_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            let Some(verifier) = exchange.param(wire::param::CODE_VERIFIER) else {
                return RuleOutcome::fail_at(
                    "token request omits the code_verifier pledged by the \
                     authorization request; the server must refuse the exchange \
                     with invalid_grant",
                    [step::TOKEN_REQUEST],
                );
            };
            if pkce::challenge_matches(verifier, method, challenge) {
                RuleOutcome::Pass
            } else {
                RuleOutcome::fail_at(
                    format!(
                        "code_verifier does not recompute to the pledged \
                         code_challenge under {}; the server must refuse the \
                         exchange with invalid_grant",
                        method.as_str()
                    ),
                    [step::AUTHORIZATION_REQUEST, step::TOKEN_REQUEST],
                )
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn redirect_exact(config: &EngineConfig) -> Rule {
    let registered = config.registered_redirect_uris.clone();
    Rule::new(
        AC_REDIRECT_EXACT,
        [GrantType::AuthorizationCodePkce],
        "RFC 6749 section 3.1.2.3",
        Severity::Critical,
        move |session| {
            if registered.is_empty() {
                return RuleOutcome::NotApplicable;
            }
            let mut checked = false;
            for record in session.steps() {
                let Some(uri) = record.param(wire::param::REDIRECT_URI) else {
                    continue;
                };
                checked = true;
                // Byte identity only. No case folding, no trailing-slash or
                // dot-segment normalization, no query stripping.
                if !registered.contains(uri) {
                    return RuleOutcome::fail_at(
                        format!("redirect_uri `{uri}` is not byte-identical to any registered redirect URI"),
                        [record.name().to_owned()],
                    );
                }
            }
            if checked {
                RuleOutcome::Pass
            } else {
                RuleOutcome::NotApplicable
            }
        },
    )
    .trigger_on([step::AUTHORIZATION_REQUEST, step::TOKEN_REQUEST])
}

/// First code value presented in more than one token request, if any.
fn replayed_code(session: &crate::session::FlowSession) -> Option<String> {
    let mut seen = std::collections::BTreeSet::new();
    for request in session.steps_named(step::TOKEN_REQUEST) {
        if let Some(code) = request.param(wire::param::CODE) {
            if !seen.insert(code.to_owned()) {
                return Some(code.to_owned());
            }
        }
    }
    None
}

fn code_replay() -> Rule {
    Rule::new(
        AC_CODE_REPLAY,
        [GrantType::AuthorizationCodePkce],
        "RFC 6749 section 4.1.2",
        Severity::Critical,
        |session| {
            if !session
                .steps_named(step::TOKEN_REQUEST)
                .any(|r| r.has_param(wire::param::CODE))
            {
                return RuleOutcome::NotApplicable;
            }
            match replayed_code(session) {
                Some(code) => RuleOutcome::fail_at(
                    format!("authorization code `{code}` was presented in more than one token request; codes are single-use"),
                    [step::TOKEN_REQUEST],
                ),
                None => RuleOutcome::Pass,
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn code_revoke() -> Rule {
    Rule::new(
        AC_CODE_REVOKE,
        [GrantType::AuthorizationCodePkce],
        "RFC 6749 section 4.1.2",
        Severity::High,
        |session| {
            // The obligation only arises once a replay happened.
            match replayed_code(session) {
                Some(code) => RuleOutcome::fail_at(
                    format!("every token previously issued for authorization code `{code}` must be revoked after its reuse"),
                    [step::TOKEN_REQUEST],
                ),
                None => RuleOutcome::NotApplicable,
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

fn code_lifetime(config: &EngineConfig) -> Rule {
    let lifetime_secs = config.authorization_code_lifetime_secs;
    Rule::new(
        AC_CODE_LIFETIME,
        [GrantType::AuthorizationCodePkce],
        "RFC 6749 section 4.1.2",
        Severity::Medium,
        move |session| {
            let Ok(issued) = session.get_step(step::AUTHORIZATION_RESPONSE) else {
                return RuleOutcome::NotApplicable;
            };
            if !issued.has_param(wire::param::CODE) {
                return RuleOutcome::NotApplicable;
            }
            let Ok(exchange) = session.get_step(step::TOKEN_REQUEST) else {
                return RuleOutcome::NotApplicable;
            };
            let age_secs = (exchange.observed_at() - issued.observed_at()).num_seconds();
            if age_secs > lifetime_secs {
                RuleOutcome::fail_at(
                    format!(
                        "authorization code was exchanged {age_secs}s after issuance, \
                         past the {lifetime_secs}s lifetime"
                    ),
                    [step::TOKEN_REQUEST],
                )
            } else {
                RuleOutcome::Pass
            }
        },
    )
    .trigger_on([step::TOKEN_REQUEST])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Direction, FlowSession, TransportScheme};
    use chrono::{DateTime, TimeZone, Utc};

    // RFC 7636 appendix B.
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    const REGISTERED_URI: &str = "https://app.example/cb";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rule(id: &str) -> Rule {
        rules(&EngineConfig::default())
            .into_iter()
            .find(|r| r.id() == id)
            .unwrap()
    }

    fn record(
        session: &mut FlowSession,
        name: &str,
        direction: Direction,
        params: &[(&str, &str)],
        at: DateTime<Utc>,
    ) {
        session
            .record_step(name, direction, TransportScheme::Https, params.iter().copied(), at)
            .unwrap();
    }

    /// A complete S256 exchange built around the appendix B vector.
    fn rfc_session(verifier: &str) -> FlowSession {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[
                ("response_type", "code"),
                ("client_id", "web-app"),
                ("redirect_uri", REGISTERED_URI),
                ("state", "af0ifjsldkj"),
                ("code_challenge", RFC_CHALLENGE),
                ("code_challenge_method", "S256"),
            ],
            t(1),
        );
        record(
            &mut s,
            step::AUTHORIZATION_RESPONSE,
            Direction::ServerToClient,
            &[("code", "SplxlOBeZQQYbYS6WxSbIA"), ("state", "af0ifjsldkj")],
            t(2),
        );
        record(
            &mut s,
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            &[
                ("grant_type", "authorization_code"),
                ("code", "SplxlOBeZQQYbYS6WxSbIA"),
                ("redirect_uri", REGISTERED_URI),
                ("code_verifier", verifier),
            ],
            t(3),
        );
        s
    }

    // -- PKCE layers --------------------------------------------------------

    #[test]
    fn rfc_7636_vector_passes_every_pkce_rule() {
        let s = rfc_session(RFC_VERIFIER);
        for id in [
            AC_PKCE_REQUIRED,
            AC_PKCE_METHOD,
            AC_PKCE_PLAIN,
            AC_VERIFIER_FORMAT,
            AC_PKCE_MATCH,
        ] {
            assert_eq!(rule(id).evaluate(&s), RuleOutcome::Pass, "rule {id}");
        }
    }

    #[test]
    fn tampered_verifier_fails_only_the_match_rule() {
        // Same length, same charset, one byte off.
        let tampered = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXj";
        let s = rfc_session(tampered);
        assert_eq!(rule(AC_VERIFIER_FORMAT).evaluate(&s), RuleOutcome::Pass);
        let matched = rule(AC_PKCE_MATCH);
        assert_eq!(matched.severity(), Severity::Critical);
        match matched.evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("invalid_grant")),
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[test]
    fn missing_verifier_after_a_pledge_is_a_mismatch() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[("response_type", "code"), ("code_challenge", RFC_CHALLENGE)],
            t(1),
        );
        record(
            &mut s,
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            &[("grant_type", "authorization_code"), ("code", "c1")],
            t(2),
        );
        match rule(AC_PKCE_MATCH).evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("invalid_grant")),
            other => panic!("expected fail, got {other:?}"),
        }
        // No verifier on the wire means no format judgement either.
        assert_eq!(rule(AC_VERIFIER_FORMAT).evaluate(&s), RuleOutcome::NotApplicable);
    }

    #[test]
    fn plain_transform_recomputes_but_is_discouraged() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[
                ("response_type", "code"),
                ("code_challenge", RFC_VERIFIER),
                ("code_challenge_method", "plain"),
            ],
            t(1),
        );
        record(
            &mut s,
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            &[("code", "c1"), ("code_verifier", RFC_VERIFIER)],
            t(2),
        );
        assert_eq!(rule(AC_PKCE_MATCH).evaluate(&s), RuleOutcome::Pass);
        assert!(rule(AC_PKCE_PLAIN).evaluate(&s).is_fail());
    }

    #[test]
    fn omitted_method_means_plain() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[("response_type", "code"), ("code_challenge", RFC_VERIFIER)],
            t(1),
        );
        record(
            &mut s,
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            &[("code", "c1"), ("code_verifier", RFC_VERIFIER)],
            t(2),
        );
        assert_eq!(rule(AC_PKCE_METHOD).evaluate(&s), RuleOutcome::NotApplicable);
        assert_eq!(rule(AC_PKCE_MATCH).evaluate(&s), RuleOutcome::Pass);
        assert!(rule(AC_PKCE_PLAIN).evaluate(&s).is_fail());
    }

    #[test]
    fn transform_names_are_case_sensitive() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[
                ("response_type", "code"),
                ("code_challenge", RFC_CHALLENGE),
                ("code_challenge_method", "s256"),
            ],
            t(1),
        );
        match rule(AC_PKCE_METHOD).evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("s256")),
            other => panic!("expected fail, got {other:?}"),
        }
        // Nothing to recompute with.
        assert_eq!(rule(AC_PKCE_MATCH).evaluate(&s), RuleOutcome::NotApplicable);
    }

    #[test]
    fn missing_challenge_fails_the_requirement_rule() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[("response_type", "code"), ("client_id", "web-app")],
            t(1),
        );
        assert!(rule(AC_PKCE_REQUIRED).evaluate(&s).is_fail());
        assert_eq!(rule(AC_PKCE_MATCH).evaluate(&s), RuleOutcome::NotApplicable);
    }

    #[test]
    fn overlong_verifier_is_malformed() {
        let s = rfc_session(&"a".repeat(129));
        match rule(AC_VERIFIER_FORMAT).evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("malformed")),
            other => panic!("expected fail, got {other:?}"),
        }
    }

    // -- Redirect URI -------------------------------------------------------

    #[test]
    fn redirect_uri_must_be_byte_identical_to_a_registration() {
        let config = EngineConfig::default().with_registered_redirect_uri(REGISTERED_URI);
        let exact = rules(&config)
            .into_iter()
            .find(|r| r.id() == AC_REDIRECT_EXACT)
            .unwrap();

        let variants = [
            "https://app.example/cb/",
            "https://app.example/CB",
            "https://app.example/cb?x=1",
            "https://app.example/../evil",
        ];
        for uri in variants {
            let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
            record(
                &mut s,
                step::AUTHORIZATION_REQUEST,
                Direction::ClientToServer,
                &[("response_type", "code"), ("redirect_uri", uri)],
                t(1),
            );
            match exact.evaluate(&s) {
                RuleOutcome::Fail { reason, .. } => assert!(reason.contains(uri), "{uri}"),
                other => panic!("variant `{uri}` slipped through: {other:?}"),
            }
        }

        let s = rfc_session(RFC_VERIFIER);
        assert_eq!(exact.evaluate(&s), RuleOutcome::Pass);
    }

    #[test]
    fn redirect_rule_is_silent_without_registrations() {
        let s = rfc_session(RFC_VERIFIER);
        assert_eq!(rule(AC_REDIRECT_EXACT).evaluate(&s), RuleOutcome::NotApplicable);
    }

    // -- Code hygiene -------------------------------------------------------

    #[test]
    fn replayed_code_raises_replay_and_revocation() {
        let mut s = rfc_session(RFC_VERIFIER);
        record(
            &mut s,
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            &[
                ("grant_type", "authorization_code"),
                ("code", "SplxlOBeZQQYbYS6WxSbIA"),
                ("code_verifier", RFC_VERIFIER),
            ],
            t(10),
        );
        let replay = rule(AC_CODE_REPLAY).evaluate(&s);
        match &replay {
            RuleOutcome::Fail { reason, .. } => assert!(reason.contains("SplxlOBeZQQYbYS6WxSbIA")),
            other => panic!("expected fail, got {other:?}"),
        }
        assert!(rule(AC_CODE_REVOKE).evaluate(&s).is_fail());
    }

    #[test]
    fn distinct_codes_do_not_trip_the_replay_rules() {
        let s = rfc_session(RFC_VERIFIER);
        assert_eq!(rule(AC_CODE_REPLAY).evaluate(&s), RuleOutcome::Pass);
        assert_eq!(rule(AC_CODE_REVOKE).evaluate(&s), RuleOutcome::NotApplicable);
    }

    #[test]
    fn stale_code_exchange_is_flagged() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_RESPONSE,
            Direction::ServerToClient,
            &[("code", "c1"), ("state", "xyz")],
            t(0),
        );
        record(
            &mut s,
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            &[("code", "c1"), ("code_verifier", RFC_VERIFIER)],
            t(601),
        );
        match rule(AC_CODE_LIFETIME).evaluate(&s) {
            RuleOutcome::Fail { reason, .. } => {
                assert!(reason.contains("601s"));
                assert!(reason.contains("600s"));
            }
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[test]
    fn prompt_exchange_is_within_lifetime() {
        let s = rfc_session(RFC_VERIFIER);
        assert_eq!(rule(AC_CODE_LIFETIME).evaluate(&s), RuleOutcome::Pass);
    }

    #[test]
    fn response_type_must_be_code() {
        let mut s = FlowSession::new(GrantType::AuthorizationCodePkce, t(0));
        record(
            &mut s,
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            &[("response_type", "token"), ("code_challenge", RFC_CHALLENGE)],
            t(1),
        );
        assert!(rule(AC_RESPONSE_TYPE).evaluate(&s).is_fail());
    }
}
