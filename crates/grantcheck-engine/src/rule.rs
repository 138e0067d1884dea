//! Conformance rules, their outcomes, and findings.
//!
//! A [`Rule`] packages a pure predicate over a [`FlowSession`] with the
//! metadata a reader needs to act on its failure: stable id, severity,
//! normative citation, applicable grants, and the step names that trigger
//! it during advance-time evaluation. Predicates must be deterministic
//! functions of the session alone (no clock reads, no hidden state), so
//! evaluation is replayable.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grant::GrantType;
use crate::session::FlowSession;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Finding severity, declared in ascending order so the derived ordering
/// makes `max()` the worst case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Advisory only; includes rule-evaluation errors.
    Info,
    /// Hygiene concern worth fixing.
    Low,
    /// Conformance gap without immediate compromise.
    Medium,
    /// Weakness an attacker can leverage.
    High,
    /// Active compromise or directly exploitable defect.
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RuleOutcome
// ---------------------------------------------------------------------------

/// Verdict of one predicate over one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The obligation holds on the facts recorded so far.
    Pass,
    /// The obligation is violated. `reason` explains on which facts;
    /// `steps` names the offending step records.
    Fail { reason: String, steps: Vec<String> },
    /// The facts the rule judges are not present yet.
    NotApplicable,
}

impl RuleOutcome {
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
            steps: Vec::new(),
        }
    }

    pub fn fail_at<S: Into<String>>(
        reason: impl Into<String>,
        steps: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::Fail {
            reason: reason.into(),
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// Pure predicate over a flow session.
pub type RulePredicate = Box<dyn Fn(&FlowSession) -> RuleOutcome + Send + Sync>;

/// One conformance rule. Immutable after construction; registered once.
pub struct Rule {
    id: String,
    grants: BTreeSet<GrantType>,
    citation: String,
    severity: Severity,
    trigger_steps: BTreeSet<String>,
    predicate: RulePredicate,
}

impl Rule {
    /// Build a rule that triggers on every step. Restrict with
    /// [`Rule::trigger_on`].
    pub fn new<F>(
        id: impl Into<String>,
        grants: impl IntoIterator<Item = GrantType>,
        citation: impl Into<String>,
        severity: Severity,
        predicate: F,
    ) -> Self
    where
        F: Fn(&FlowSession) -> RuleOutcome + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            grants: grants.into_iter().collect(),
            citation: citation.into(),
            severity,
            trigger_steps: BTreeSet::new(),
            predicate: Box::new(predicate),
        }
    }

    /// Restrict advance-time evaluation to the named steps. Full evaluation
    /// ignores the restriction; it only trims the per-step pass.
    pub fn trigger_on<S: Into<String>>(mut self, steps: impl IntoIterator<Item = S>) -> Self {
        self.trigger_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn grants(&self) -> &BTreeSet<GrantType> {
        &self.grants
    }

    pub fn citation(&self) -> &str {
        &self.citation
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn trigger_steps(&self) -> &BTreeSet<String> {
        &self.trigger_steps
    }

    pub fn applies_to(&self, grant_type: GrantType) -> bool {
        self.grants.contains(&grant_type)
    }

    /// Whether the per-step pass evaluates this rule after `step` was
    /// recorded. An empty trigger set means every step.
    pub fn triggers_on(&self, step: &str) -> bool {
        self.trigger_steps.is_empty() || self.trigger_steps.contains(step)
    }

    /// Run the predicate. Callers wanting panic isolation go through the
    /// evaluator instead of calling this directly.
    pub fn evaluate(&self, session: &FlowSession) -> RuleOutcome {
        (self.predicate)(session)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("grants", &self.grants)
            .field("citation", &self.citation)
            .field("severity", &self.severity)
            .field("trigger_steps", &self.trigger_steps)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

/// One detected violation. Carries everything a reporting layer needs
/// without consulting the engine again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub explanation: String,
    /// Names of the offending steps, in the order the rule implicates them.
    pub steps: Vec<String>,
    pub citation: String,
}

impl Finding {
    pub(crate) fn from_rule(rule: &Rule, explanation: String, steps: Vec<String>) -> Self {
        Self {
            rule_id: rule.id().to_string(),
            severity: rule.severity(),
            explanation,
            steps,
            citation: rule.citation().to_string(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} ({})",
            self.severity, self.rule_id, self.explanation, self.citation
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn session() -> FlowSession {
        FlowSession::new(
            GrantType::Implicit,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    #[test]
    fn severity_orders_ascending_to_critical() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::ALL.iter().max(), Some(&Severity::Critical));
        assert_eq!(Severity::Critical.as_str(), "critical");
    }

    #[test]
    fn rule_evaluates_through_its_predicate() {
        let rule = Rule::new(
            "T-ALWAYS-FAIL",
            [GrantType::Implicit],
            "RFC 0000 section 0",
            Severity::Low,
            |_s| RuleOutcome::fail("always"),
        );
        assert!(rule.evaluate(&session()).is_fail());
        assert!(rule.applies_to(GrantType::Implicit));
        assert!(!rule.applies_to(GrantType::DeviceCode));
    }

    #[test]
    fn empty_trigger_set_means_every_step() {
        let rule = Rule::new(
            "T-ANY",
            [GrantType::Implicit],
            "RFC 0000",
            Severity::Info,
            |_s| RuleOutcome::Pass,
        );
        assert!(rule.triggers_on("authorization_request"));
        assert!(rule.triggers_on("anything"));

        let restricted = Rule::new(
            "T-SOME",
            [GrantType::Implicit],
            "RFC 0000",
            Severity::Info,
            |_s| RuleOutcome::Pass,
        )
        .trigger_on(["fragment_response"]);
        assert!(restricted.triggers_on("fragment_response"));
        assert!(!restricted.triggers_on("authorization_request"));
    }

    #[test]
    fn finding_serde_round_trip() {
        let finding = Finding {
            rule_id: "AC-PKCE-MATCH".to_string(),
            severity: Severity::Critical,
            explanation: "recomputed challenge does not match".to_string(),
            steps: vec!["token_request".to_string()],
            citation: "RFC 7636 section 4.6".to_string(),
        };
        let json = serde_json::to_string(&finding).unwrap();
        assert!(json.contains("\"severity\":\"critical\""));
        let back: Finding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, finding);
    }

    #[test]
    fn rule_debug_omits_the_predicate() {
        let rule = Rule::new(
            "T-DEBUG",
            [GrantType::ClientCredentials],
            "RFC 6749 section 4.4",
            Severity::Medium,
            |_s| RuleOutcome::Pass,
        );
        let dump = format!("{rule:?}");
        assert!(dump.contains("T-DEBUG"));
        assert!(dump.contains(".."));
    }
}
