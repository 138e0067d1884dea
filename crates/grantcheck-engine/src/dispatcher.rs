//! Advance-time orchestration.
//!
//! [`FlowDispatcher::advance`] is the single write path for driven
//! sessions: it validates the step against the grant's state machine,
//! records it, feeds the cross-session ledger, and runs the rules the step
//! triggers. A rejected step records nothing, so a session driven through
//! the dispatcher only ever holds a legal step sequence.
//!
//! Every advance, accepted or rejected, appends a structured audit event.
//! Events accumulate until drained; reporting layers serialize them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluator::{self, EvalError, Evaluator};
use crate::grant::GrantType;
use crate::ledger::CrossSessionLedger;
use crate::registry::RuleRegistry;
use crate::rule::Finding;
use crate::session::{self, Direction, FactError, FlowSession, SessionId, TransportScheme};
use crate::state_machine::{self, step, FlowState, IllegalStep};
use crate::wire;

const COMPONENT: &str = "flow_dispatcher";

const EVENT_ADVANCED: &str = "step_advanced";
const EVENT_REJECTED: &str = "step_rejected";

// ---------------------------------------------------------------------------
// StepInput
// ---------------------------------------------------------------------------

/// One observed exchange, as handed to the dispatcher by a capture driver.
///
/// Params stay an ordered pair list until the dispatcher collapses them, so
/// a repeated key is still visible as the defect it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInput {
    pub name: String,
    pub direction: Direction,
    pub scheme: TransportScheme,
    pub params: Vec<(String, String)>,
    pub observed_at: DateTime<Utc>,
}

impl StepInput {
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        scheme: TransportScheme,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            scheme,
            params: Vec::new(),
            observed_at,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The step is not legal from the session's current state. Nothing was
    /// recorded; the caller decides whether to keep driving the session.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalStep),

    /// The step itself is structurally unusable (repeated param key,
    /// regressing timestamp).
    #[error(transparent)]
    Fact(#[from] FactError),

    /// The registry cannot judge this session's grant type.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Stable error codes for the dispatcher. Inner codes pass through so a
/// log consumer sees one namespace per failing layer.
pub fn error_code(err: &DispatchError) -> &'static str {
    match err {
        DispatchError::IllegalTransition(_) => "DISPATCH_ILLEGAL_TRANSITION",
        DispatchError::Fact(inner) => session::error_code(inner),
        DispatchError::Eval(inner) => evaluator::error_code(inner),
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Structured audit record of one advance attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub session: SessionId,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
    pub step: String,
    pub from_state: String,
    pub to_state: Option<String>,
    pub finding_count: usize,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FlowDispatcher
// ---------------------------------------------------------------------------

/// Outcome of one accepted advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub new_state: FlowState,
    /// Ledger findings first (they arise while recording), then the
    /// findings of the rules this step triggers.
    pub findings: Vec<Finding>,
}

pub struct FlowDispatcher<'r> {
    registry: &'r RuleRegistry,
    ledger: CrossSessionLedger,
    events: Vec<AuditEvent>,
}

impl<'r> FlowDispatcher<'r> {
    pub fn new(registry: &'r RuleRegistry) -> Self {
        Self {
            registry,
            ledger: CrossSessionLedger::new(),
            events: Vec::new(),
        }
    }

    /// Validate, record, and judge one step.
    ///
    /// Order matters: coverage is checked before anything mutates, the
    /// transition before the record, the ledger right after the record and
    /// before the triggered rules. On any error the session is exactly as
    /// it was before the call.
    pub fn advance(
        &mut self,
        input: StepInput,
        flow: &mut FlowSession,
    ) -> Result<Advance, DispatchError> {
        let grant_type = flow.grant_type();
        let from = flow.current_state();

        if !self.registry.covers(grant_type) {
            let err = EvalError::UnknownGrantType { grant_type };
            self.push_rejected(flow, &input, from, evaluator::error_code(&err));
            return Err(err.into());
        }

        let params = match session::collect_params(
            &input.name,
            input.params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ) {
            Ok(map) => map,
            Err(err) => {
                self.push_rejected(flow, &input, from, session::error_code(&err));
                return Err(err.into());
            }
        };

        let to = match state_machine::transition(grant_type, from, &input.name, &params) {
            Ok(next) => next,
            Err(illegal) => {
                self.push_rejected(flow, &input, from, "DISPATCH_ILLEGAL_TRANSITION");
                return Err(illegal.into());
            }
        };

        // Plucked before the map moves into the record.
        let initiating_state = initiating_state_value(&input.name, &params);
        let exchanged_code = exchanged_code_value(grant_type, &input.name, &params);

        if let Err(err) =
            flow.record_step_map(&input.name, input.direction, input.scheme, params, input.observed_at)
        {
            self.push_rejected(flow, &input, from, session::error_code(&err));
            return Err(err.into());
        }

        let mut findings = Vec::new();
        if let Some(value) = initiating_state {
            findings.extend(
                self.ledger
                    .observe_initiating_state(flow.id(), &input.name, &value),
            );
        }
        if let Some(code) = exchanged_code {
            findings.extend(self.ledger.observe_code_exchange(flow.id(), &input.name, &code));
        }

        if let Some(outcome) = to.terminal_outcome() {
            flow.set_outcome(outcome);
        }

        findings.extend(Evaluator::new(self.registry).evaluate_step(flow, &input.name)?);

        self.events.push(AuditEvent {
            session: flow.id(),
            component: COMPONENT.to_string(),
            event: EVENT_ADVANCED.to_string(),
            outcome: "ok".to_string(),
            error_code: None,
            step: input.name.clone(),
            from_state: from.to_string(),
            to_state: Some(to.to_string()),
            finding_count: findings.len(),
            observed_at: input.observed_at,
        });

        Ok(Advance {
            new_state: to,
            findings,
        })
    }

    /// Full evaluation of a session, through the same registry. Never
    /// consults the ledger, so it is idempotent.
    pub fn evaluate(&self, flow: &FlowSession) -> Result<Vec<Finding>, EvalError> {
        Evaluator::new(self.registry).evaluate(flow)
    }

    // -- Accessors ----------------------------------------------------------

    /// Access accumulated audit events.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Drain accumulated audit events.
    pub fn drain_events(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.events)
    }

    fn push_rejected(
        &mut self,
        flow: &FlowSession,
        input: &StepInput,
        from: FlowState,
        code: &'static str,
    ) {
        self.events.push(AuditEvent {
            session: flow.id(),
            component: COMPONENT.to_string(),
            event: EVENT_REJECTED.to_string(),
            outcome: "error".to_string(),
            error_code: Some(code.to_string()),
            step: input.name.clone(),
            from_state: from.to_string(),
            to_state: None,
            finding_count: 0,
            observed_at: input.observed_at,
        });
    }
}

/// `state` value of a flow-initiating request, if this step carries one.
fn initiating_state_value(
    step_name: &str,
    params: &std::collections::BTreeMap<String, String>,
) -> Option<String> {
    if step_name == step::AUTHORIZATION_REQUEST || step_name == step::DEVICE_AUTHORIZATION_REQUEST {
        params.get(wire::param::STATE).cloned()
    } else {
        None
    }
}

/// Authorization code presented for exchange, if this step is one.
fn exchanged_code_value(
    grant_type: GrantType,
    step_name: &str,
    params: &std::collections::BTreeMap<String, String>,
) -> Option<String> {
    if grant_type == GrantType::AuthorizationCodePkce && step_name == step::TOKEN_REQUEST {
        params.get(wire::param::CODE).cloned()
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
