//! Flow fact model: the canonical representation of one grant-flow
//! execution's observable facts.
//!
//! A [`FlowSession`] is an append-only sequence of [`StepRecord`]s. Records
//! are immutable once appended; correcting a capture mistake means recording
//! a new step, never editing an old one, so the audit trail replay/CSRF
//! rules depend on is preserved. The session's current flow state is always
//! derived by replaying the recorded steps through the grant's state
//! machine, never stored, so it cannot drift from the facts.
//!
//! Every rule predicate in the engine is a pure function of one
//! `FlowSession`. Timestamps enter here as captured data; the engine itself
//! never reads a clock.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::grant::{FlowOutcome, GrantType};
use crate::state_machine::{self, FlowState};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Unique identifier of one flow session.
///
/// Random (v4) construction guarantees uniqueness across concurrently
/// created sessions without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic construction for tests and replay tooling.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// ---------------------------------------------------------------------------
// Direction / TransportScheme
// ---------------------------------------------------------------------------

/// Which party emitted the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "client_to_server",
            Self::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport scheme the exchange was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportScheme {
    Http,
    Https,
}

impl TransportScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FactError
// ---------------------------------------------------------------------------

/// Structural misuse of the fact model. Always fatal to the single call,
/// never retried, never silently accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactError {
    /// `params` contained the same key twice. Last-write-wins would hide
    /// parameter-injection evidence, so the whole record is rejected.
    #[error("step `{step}` repeats parameter key `{key}`")]
    DuplicateParamKey { step: String, key: String },

    /// The step's timestamp precedes the previously recorded step's.
    #[error("step `{step}` observed at {observed} before previous step at {previous}")]
    OutOfOrderTimestamp {
        step: String,
        previous: DateTime<Utc>,
        observed: DateTime<Utc>,
    },

    /// No step with that name has been recorded.
    #[error("no step named `{step}` recorded")]
    StepNotFound { step: String },
}

/// Stable error codes for the fact model.
pub fn error_code(err: &FactError) -> &'static str {
    match err {
        FactError::DuplicateParamKey { .. } => "FACT_DUPLICATE_PARAM_KEY",
        FactError::OutOfOrderTimestamp { .. } => "FACT_OUT_OF_ORDER_TIMESTAMP",
        FactError::StepNotFound { .. } => "FACT_STEP_NOT_FOUND",
    }
}

/// Collapse an ordered pair list into a param map, rejecting repeated keys.
pub(crate) fn collect_params<K, V, I>(
    step: &str,
    params: I,
) -> Result<BTreeMap<String, String>, FactError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut map = BTreeMap::new();
    for (key, value) in params {
        let key = key.into();
        if map.insert(key.clone(), value.into()).is_some() {
            return Err(FactError::DuplicateParamKey {
                step: step.to_string(),
                key,
            });
        }
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// One observed protocol exchange. Immutable after recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    name: String,
    direction: Direction,
    scheme: TransportScheme,
    params: BTreeMap<String, String>,
    observed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn scheme(&self) -> TransportScheme {
        self.scheme
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Value of one parameter, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Whether the parameter is present (including with an empty value).
    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

// ---------------------------------------------------------------------------
// FlowSession
// ---------------------------------------------------------------------------

/// One end-to-end attempt to complete a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSession {
    id: SessionId,
    grant_type: GrantType,
    created_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
    outcome: FlowOutcome,
}

impl FlowSession {
    /// Create a session with a fresh random id. `created_at` is supplied by
    /// the caller (the engine never reads the clock).
    pub fn new(grant_type: GrantType, created_at: DateTime<Utc>) -> Self {
        Self::with_id(SessionId::random(), grant_type, created_at)
    }

    /// Create a session with an explicit id, for tests and replay tooling.
    pub fn with_id(id: SessionId, grant_type: GrantType, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            grant_type,
            created_at,
            steps: Vec::new(),
            outcome: FlowOutcome::Pending,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn grant_type(&self) -> GrantType {
        self.grant_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn outcome(&self) -> FlowOutcome {
        self.outcome
    }

    /// All recorded steps, in execution order.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// The most recently recorded step.
    pub fn last_step(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    /// Append one observed exchange.
    ///
    /// `params` is taken as an ordered pair list so a repeated key is
    /// detectable before it collapses into the map; a repeated key rejects
    /// the whole record. Timestamps must not regress relative to the
    /// previously recorded step; equal timestamps are accepted, since
    /// captured exchanges can share a clock tick.
    pub fn record_step<K, V, I>(
        &mut self,
        name: &str,
        direction: Direction,
        scheme: TransportScheme,
        params: I,
        observed_at: DateTime<Utc>,
    ) -> Result<&StepRecord, FactError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = collect_params(name, params)?;
        self.record_step_map(name, direction, scheme, map, observed_at)
    }

    /// Record variant taking an already-collapsed param map. The dispatcher
    /// collapses params up front so it can consult them during transition
    /// validation, then records through here without a second pass.
    pub(crate) fn record_step_map(
        &mut self,
        name: &str,
        direction: Direction,
        scheme: TransportScheme,
        params: BTreeMap<String, String>,
        observed_at: DateTime<Utc>,
    ) -> Result<&StepRecord, FactError> {
        if let Some(previous) = self.steps.last() {
            if observed_at < previous.observed_at {
                return Err(FactError::OutOfOrderTimestamp {
                    step: name.to_string(),
                    previous: previous.observed_at,
                    observed: observed_at,
                });
            }
        }

        self.steps.push(StepRecord {
            name: name.to_string(),
            direction,
            scheme,
            params,
            observed_at,
        });
        let last = self.steps.len() - 1;
        Ok(&self.steps[last])
    }

    /// First recorded step with the given name.
    pub fn get_step(&self, name: &str) -> Result<&StepRecord, FactError> {
        self.steps
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| FactError::StepNotFound {
                step: name.to_string(),
            })
    }

    /// All recorded steps with the given name, in execution order. Repeated
    /// names are legal where the state machine allows them (device polling,
    /// replayed exchanges).
    pub fn steps_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StepRecord> {
        self.steps.iter().filter(move |s| s.name == name)
    }

    /// Current flow state, derived by replaying the recorded steps through
    /// this grant's state machine. Steps beyond the longest legal prefix do
    /// not move the state; the legal-sequence rule flags them.
    pub fn current_state(&self) -> FlowState {
        state_machine::replay(self.grant_type, &self.steps)
    }

    /// Mark a still-pending session as abandoned by its driver. Terminal
    /// outcomes reached through the dispatcher are never overwritten.
    pub fn mark_abandoned(&mut self) {
        if self.outcome == FlowOutcome::Pending {
            self.outcome = FlowOutcome::Abandoned;
        }
    }

    pub(crate) fn set_outcome(&mut self, outcome: FlowOutcome) {
        self.outcome = outcome;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
