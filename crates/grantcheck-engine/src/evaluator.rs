//! Rule evaluation over a flow session.
//!
//! The evaluator walks the frozen registry's rules for the session's grant
//! in registration order and collects [`Finding`]s from failing predicates.
//! It is stateless and pure: evaluating the same session twice yields the
//! same findings in the same order, and zero findings is the normal
//! "conformant so far" result, not an error.
//!
//! A panicking predicate is a defect in that one rule, not grounds to lose
//! the rest of the evaluation: the panic is caught and surfaced as an Info
//! finding carrying the rule id, and the remaining rules still run.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grant::GrantType;
use crate::registry::RuleRegistry;
use crate::rule::{Finding, Rule, RuleOutcome, Severity};
use crate::session::{FlowSession, SessionId};

/// Explanation prefix of the Info finding emitted when a predicate panics.
pub const RULE_EVALUATION_ERROR_EXPLANATION: &str = "rule evaluation error";

// ---------------------------------------------------------------------------
// EvalError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// The registry holds no rules for this grant type. Judging a flow with
    /// zero applicable rules would report "conformant" vacuously, so it is
    /// refused instead.
    #[error("no rules registered for grant `{grant_type}`")]
    UnknownGrantType { grant_type: GrantType },
}

/// Stable error codes for the evaluator.
pub fn error_code(err: &EvalError) -> &'static str {
    match err {
        EvalError::UnknownGrantType { .. } => "EVAL_UNKNOWN_GRANT_TYPE",
    }
}

// ---------------------------------------------------------------------------
// EvaluationReport
// ---------------------------------------------------------------------------

/// Full evaluation output with coverage retained: which rules ran, which
/// passed, and the severity profile of what failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub session_id: SessionId,
    pub grant_type: GrantType,
    pub rules_evaluated: usize,
    pub passed_rule_ids: Vec<String>,
    pub not_applicable: usize,
    pub findings: Vec<Finding>,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub worst_severity: Option<Severity>,
}

impl EvaluationReport {
    pub fn is_conformant(&self) -> bool {
        self.findings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct Evaluator<'r> {
    registry: &'r RuleRegistry,
}

impl<'r> Evaluator<'r> {
    pub fn new(registry: &'r RuleRegistry) -> Self {
        Self { registry }
    }

    /// Evaluate every applicable rule. Failures become findings; `Pass` and
    /// `NotApplicable` are dropped.
    pub fn evaluate(&self, session: &FlowSession) -> Result<Vec<Finding>, EvalError> {
        Ok(self.run(session, |_rule| true)?.findings)
    }

    /// Evaluate only the rules triggered by `step` having just been
    /// recorded. The restriction is an optimization for advance-time
    /// checks: its findings are always a subset of [`Evaluator::evaluate`].
    pub fn evaluate_step(
        &self,
        session: &FlowSession,
        step: &str,
    ) -> Result<Vec<Finding>, EvalError> {
        Ok(self.run(session, |rule| rule.triggers_on(step))?.findings)
    }

    /// Evaluate every applicable rule and keep the coverage detail.
    pub fn evaluate_with_coverage(
        &self,
        session: &FlowSession,
    ) -> Result<EvaluationReport, EvalError> {
        let run = self.run(session, |_rule| true)?;

        let mut severity_counts: BTreeMap<Severity, usize> = BTreeMap::new();
        for finding in &run.findings {
            *severity_counts.entry(finding.severity).or_insert(0) += 1;
        }
        let worst_severity = run.findings.iter().map(|f| f.severity).max();

        Ok(EvaluationReport {
            session_id: session.id(),
            grant_type: session.grant_type(),
            rules_evaluated: run.evaluated,
            passed_rule_ids: run.passed,
            not_applicable: run.not_applicable,
            findings: run.findings,
            severity_counts,
            worst_severity,
        })
    }

    fn run<F>(&self, session: &FlowSession, filter: F) -> Result<RunOutcome, EvalError>
    where
        F: Fn(&Rule) -> bool,
    {
        let grant_type = session.grant_type();
        let rules = self.registry.rules_for(grant_type);
        if rules.is_empty() {
            return Err(EvalError::UnknownGrantType { grant_type });
        }

        let mut out = RunOutcome::default();
        for rule in rules.into_iter().filter(|rule| filter(rule)) {
            out.evaluated += 1;
            match catch_unwind(AssertUnwindSafe(|| rule.evaluate(session))) {
                Ok(RuleOutcome::Pass) => out.passed.push(rule.id().to_string()),
                Ok(RuleOutcome::NotApplicable) => out.not_applicable += 1,
                Ok(RuleOutcome::Fail { reason, steps }) => {
                    out.findings.push(Finding::from_rule(rule, reason, steps));
                }
                Err(payload) => {
                    out.findings.push(Finding {
                        rule_id: rule.id().to_string(),
                        severity: Severity::Info,
                        explanation: format!(
                            "{RULE_EVALUATION_ERROR_EXPLANATION}: {}",
                            panic_message(payload.as_ref())
                        ),
                        steps: Vec::new(),
                        citation: rule.citation().to_string(),
                    });
                }
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
struct RunOutcome {
    evaluated: usize,
    passed: Vec<String>,
    not_applicable: usize,
    findings: Vec<Finding>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "opaque panic payload"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Rule;
    use chrono::{TimeZone, Utc};

    fn session() -> FlowSession {
        FlowSession::new(
            GrantType::ClientCredentials,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    fn registry(rules: Vec<Rule>) -> RuleRegistry {
        let mut reg = RuleRegistry::new();
        for rule in rules {
            reg.register(rule).unwrap();
        }
        reg
    }

    fn failing(id: &str) -> Rule {
        Rule::new(
            id,
            [GrantType::ClientCredentials],
            "RFC 0000",
            Severity::High,
            |_s| RuleOutcome::fail_at("broken on purpose", ["token_request"]),
        )
    }

    fn passing(id: &str) -> Rule {
        Rule::new(
            id,
            [GrantType::ClientCredentials],
            "RFC 0000",
            Severity::Low,
            |_s| RuleOutcome::Pass,
        )
    }

    // -- basic verdicts -----------------------------------------------------

    #[test]
    fn failures_become_findings_in_registration_order() {
        let reg = registry(vec![failing("R-1"), passing("R-2"), failing("R-3")]);
        let findings = Evaluator::new(&reg).evaluate(&session()).unwrap();
        let ids: Vec<&str> = findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(ids, ["R-1", "R-3"]);
        assert_eq!(findings[0].steps, vec!["token_request".to_string()]);
    }

    #[test]
    fn zero_findings_is_a_valid_result() {
        let reg = registry(vec![passing("R-1")]);
        let findings = Evaluator::new(&reg).evaluate(&session()).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn unknown_grant_type_is_refused() {
        let reg = registry(vec![Rule::new(
            "R-IMPLICIT",
            [GrantType::Implicit],
            "RFC 0000",
            Severity::Low,
            |_s| RuleOutcome::Pass,
        )]);
        let err = Evaluator::new(&reg).evaluate(&session()).unwrap_err();
        assert!(matches!(
            err,
            EvalError::UnknownGrantType {
                grant_type: GrantType::ClientCredentials
            }
        ));
        assert_eq!(error_code(&err), "EVAL_UNKNOWN_GRANT_TYPE");
    }

    // -- idempotence --------------------------------------------------------

    #[test]
    fn evaluate_is_idempotent_between_advances() {
        let reg = registry(vec![failing("R-1"), passing("R-2")]);
        let evaluator = Evaluator::new(&reg);
        let s = session();
        let first = evaluator.evaluate(&s).unwrap();
        let second = evaluator.evaluate(&s).unwrap();
        assert_eq!(first, second);
    }

    // -- panic isolation ----------------------------------------------------

    #[test]
    fn panicking_rule_becomes_info_finding_and_others_still_run() {
        let panicking = Rule::new(
            "R-PANIC",
            [GrantType::ClientCredentials],
            "RFC 0000",
            Severity::Critical,
            |_s| panic!("predicate exploded"),
        );
        let reg = registry(vec![panicking, failing("R-AFTER")]);
        let findings = Evaluator::new(&reg).evaluate(&session()).unwrap();

        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].rule_id, "R-PANIC");
        assert_eq!(findings[0].severity, Severity::Info);
        assert!(findings[0].explanation.contains("rule evaluation error"));
        assert!(findings[0].explanation.contains("predicate exploded"));
        assert_eq!(findings[1].rule_id, "R-AFTER");
        assert_eq!(findings[1].severity, Severity::High);
    }

    // -- step restriction ---------------------------------------------------

    #[test]
    fn step_restriction_only_trims_the_rule_set() {
        let triggered = Rule::new(
            "R-ON-TOKEN",
            [GrantType::ClientCredentials],
            "RFC 0000",
            Severity::Medium,
            |_s| RuleOutcome::fail("always"),
        )
        .trigger_on(["token_response"]);
        let reg = registry(vec![triggered, failing("R-EVERY-STEP")]);
        let evaluator = Evaluator::new(&reg);
        let s = session();

        let on_request = evaluator.evaluate_step(&s, "token_request").unwrap();
        let ids: Vec<&str> = on_request.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(ids, ["R-EVERY-STEP"]);

        let on_response = evaluator.evaluate_step(&s, "token_response").unwrap();
        assert_eq!(on_response.len(), 2);

        // Restricted findings are a subset of the full evaluation.
        let full = evaluator.evaluate(&s).unwrap();
        for finding in &on_request {
            assert!(full.contains(finding));
        }
    }

    // -- coverage -----------------------------------------------------------

    #[test]
    fn coverage_report_counts_by_severity() {
        let na = Rule::new(
            "R-NA",
            [GrantType::ClientCredentials],
            "RFC 0000",
            Severity::Low,
            |_s| RuleOutcome::NotApplicable,
        );
        let reg = registry(vec![failing("R-HIGH"), passing("R-PASS"), na]);
        let report = Evaluator::new(&reg)
            .evaluate_with_coverage(&session())
            .unwrap();

        assert_eq!(report.rules_evaluated, 3);
        assert_eq!(report.passed_rule_ids, vec!["R-PASS".to_string()]);
        assert_eq!(report.not_applicable, 1);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.severity_counts.get(&Severity::High), Some(&1));
        assert_eq!(report.worst_severity, Some(Severity::High));
        assert!(!report.is_conformant());
    }
}
