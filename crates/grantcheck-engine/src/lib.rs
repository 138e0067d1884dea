#![forbid(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod entropy;
pub mod evaluator;
pub mod grant;
pub mod ledger;
pub mod pkce;
pub mod registry;
pub mod rule;
pub mod rulebook;
pub mod session;
pub mod state_machine;
pub mod wire;

pub use rulebook::{builtin_registry, builtin_rules};

use evaluator::{EvalError, EvaluationReport, Evaluator};
use registry::RuleRegistry;
use session::FlowSession;

/// One-call judgement: evaluate every rule applicable to the session's
/// grant and keep the coverage detail.
pub fn judge(
    registry: &RuleRegistry,
    session: &FlowSession,
) -> Result<EvaluationReport, EvalError> {
    Evaluator::new(registry).evaluate_with_coverage(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::grant::GrantType;
    use crate::session::{Direction, TransportScheme};
    use crate::state_machine::step;
    use chrono::{TimeZone, Utc};

    #[test]
    fn conformant_client_credentials_flow_judges_clean() {
        let registry = builtin_registry(&EngineConfig::default()).unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut flow = FlowSession::new(GrantType::ClientCredentials, t0);
        flow.record_step(
            step::TOKEN_REQUEST,
            Direction::ClientToServer,
            TransportScheme::Https,
            [
                ("grant_type", "client_credentials"),
                ("client_id", "service-a"),
                ("client_secret", "s3cr3t"),
            ],
            t0,
        )
        .unwrap();
        flow.record_step(
            step::TOKEN_RESPONSE,
            Direction::ServerToClient,
            TransportScheme::Https,
            [
                ("access_token", "tok"),
                ("token_type", "Bearer"),
                ("expires_in", "3600"),
            ],
            t0,
        )
        .unwrap();

        let report = judge(&registry, &flow).unwrap();
        assert!(report.is_conformant(), "findings: {:?}", report.findings);
    }

    #[test]
    fn flawless_implicit_flow_still_carries_the_deprecation_finding() {
        let registry = builtin_registry(&EngineConfig::default()).unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut flow = FlowSession::new(GrantType::Implicit, t0);
        flow.record_step(
            step::AUTHORIZATION_REQUEST,
            Direction::ClientToServer,
            TransportScheme::Https,
            [
                ("response_type", "token"),
                ("client_id", "spa"),
                ("redirect_uri", "https://app.example/cb"),
                ("state", "n-0S6_WzA2Mj_tKQ7vnZ"),
            ],
            t0,
        )
        .unwrap();
        flow.record_step(
            step::FRAGMENT_RESPONSE,
            Direction::ServerToClient,
            TransportScheme::Https,
            [
                ("access_token", "tok"),
                ("token_type", "Bearer"),
                ("expires_in", "3600"),
                ("state", "n-0S6_WzA2Mj_tKQ7vnZ"),
            ],
            t0,
        )
        .unwrap();

        let report = judge(&registry, &flow).unwrap();
        let ids: Vec<&str> = report.findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(ids, [crate::rulebook::implicit::IM_DEPRECATED_GRANT]);
    }
}
