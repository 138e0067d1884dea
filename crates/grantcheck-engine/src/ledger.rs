//! Cross-session ledger.
//!
//! Rule predicates are pure functions of one session, but two checks only
//! exist across sessions: a `state` value initiating more than one flow
//! (fixation or a broken generator) and an authorization code exchanged
//! more than once (replay). The ledger is the one stateful extension the
//! evaluator model allows: the dispatcher feeds it during `advance`, and it
//! answers with findings of its own. Plain `evaluate` never touches it, so
//! evaluation stays idempotent.
//!
//! Shared across sessions behind a `Mutex`; the frozen registry remains the
//! only lock-free shared object.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::rule::{Finding, Severity};
use crate::session::SessionId;

/// Finding id: one `state` value initiated two different sessions.
pub const XS_STATE_REUSE: &str = "XS-STATE-REUSE";
/// Finding id: one authorization code exchanged more than once.
pub const XS_CODE_REPLAY: &str = "XS-CODE-REPLAY";
/// Finding id: companion recommendation to revoke tokens issued off a
/// replayed code.
pub const XS_CODE_REVOKE: &str = "XS-CODE-REVOKE";

const STATE_REUSE_CITATION: &str = "RFC 6749 section 10.12";
const CODE_REPLAY_CITATION: &str = "RFC 6749 section 4.1.2";

#[derive(Debug, Default)]
struct LedgerInner {
    /// First session each initiating `state` value was seen on.
    initiating_states: BTreeMap<String, SessionId>,
    /// First exchange of each authorization code.
    exchanged_codes: BTreeMap<String, SessionId>,
}

/// Cross-session evidence of state reuse and code replay.
#[derive(Debug, Default)]
pub struct CrossSessionLedger {
    inner: Mutex<LedgerInner>,
}

impl CrossSessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` initiated a flow carrying this `state`
    /// value at `step`. Returns a Critical finding when a different session
    /// already initiated with the same value; per-session echo checks do
    /// not see this.
    pub fn observe_initiating_state(
        &self,
        session_id: SessionId,
        step: &str,
        value: &str,
    ) -> Vec<Finding> {
        let mut inner = self.lock();
        match inner.initiating_states.get(value) {
            None => {
                inner
                    .initiating_states
                    .insert(value.to_string(), session_id);
                Vec::new()
            }
            Some(first) if *first == session_id => Vec::new(),
            Some(first) => vec![Finding {
                rule_id: XS_STATE_REUSE.to_string(),
                severity: Severity::Critical,
                explanation: format!(
                    "state value `{value}` initiated session {session_id} but already \
                     initiated session {first}; state must be unique per flow"
                ),
                steps: vec![step.to_string()],
                citation: STATE_REUSE_CITATION.to_string(),
            }],
        }
    }

    /// Record that `session_id` presented authorization code `code` for
    /// exchange at `step`. Any second presentation, in any session, yields
    /// the replay finding plus the revocation companion.
    pub fn observe_code_exchange(
        &self,
        session_id: SessionId,
        step: &str,
        code: &str,
    ) -> Vec<Finding> {
        let mut inner = self.lock();
        match inner.exchanged_codes.get(code) {
            None => {
                inner.exchanged_codes.insert(code.to_string(), session_id);
                Vec::new()
            }
            Some(first) => {
                let where_first = if *first == session_id {
                    "the same session".to_string()
                } else {
                    format!("session {first}")
                };
                vec![
                    Finding {
                        rule_id: XS_CODE_REPLAY.to_string(),
                        severity: Severity::Critical,
                        explanation: format!(
                            "authorization code `{code}` exchanged by session {session_id} \
                             was already exchanged by {where_first}; codes are single-use"
                        ),
                        steps: vec![step.to_string()],
                        citation: CODE_REPLAY_CITATION.to_string(),
                    },
                    Finding {
                        rule_id: XS_CODE_REVOKE.to_string(),
                        severity: Severity::High,
                        explanation: format!(
                            "tokens previously issued for code `{code}` should be revoked"
                        ),
                        steps: vec![step.to_string()],
                        citation: CODE_REPLAY_CITATION.to_string(),
                    },
                ]
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        // A poisoned ledger still holds a coherent map; keep serving it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
