//! Derived runtime state: a pure fold of the event log.
//!
//! The event log is the ground truth; everything here is reproducible by
//! replaying the log from an empty state. The store is the only mutable
//! shared state in the process. It is mutated exclusively through the
//! journal and read through cheap copy-on-read snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TerminationCondition;
use crate::events::{
    kind, CreatedPayload, EvaluatedPayload, Event, FailedPayload, LlmCallPayload, Stage,
    StagePayload,
};

/// Lifecycle state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    New,
    Preparing,
    Coding,
    Presubmitting,
    Evaluating,
    Succeeded,
    Failed,
    Aborted,
}

impl CandidateState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CandidateState::Succeeded | CandidateState::Failed | CandidateState::Aborted
        )
    }
}

/// Terminal error recorded on a failed candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateError {
    pub kind: String,
    pub message: String,
}

/// One improvement attempt, as projected from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub branch: String,
    pub worktree_path: String,
    pub state: CandidateState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub error: Option<CandidateError>,
}

/// Aggregate usage counters derived from `llm_call` / `tool_invoked` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub llm_calls: u64,
    pub llm_calls_cached: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tools_invoked: u64,
}

/// Consistent view of the derived runtime state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Every candidate seen in the log, keyed by id.
    pub candidates: BTreeMap<u64, Candidate>,
    /// Ids of candidates in a non-terminal state.
    pub active: BTreeSet<u64>,
    /// Succeeded candidate with the highest primary-metric score. Ties go to
    /// the earliest finisher.
    pub best: Option<u64>,
    /// Failures since the most recent success.
    pub consecutive_failures: usize,
    /// Set once `runtime_stopping` has been recorded.
    pub shutting_down: bool,
    /// Set once `runtime_stopped` has been recorded.
    pub stopped: bool,
    /// Highest event seq folded in.
    pub last_seq: u64,
    pub usage: UsageCounters,
}

impl RuntimeSnapshot {
    /// The best candidate, if any.
    pub fn best_candidate(&self) -> Option<&Candidate> {
        self.best.and_then(|id| self.candidates.get(&id))
    }

    /// Whether any succeeded candidate satisfies `cond`.
    pub fn termination_met(&self, cond: &TerminationCondition) -> bool {
        self.candidates.values().any(|c| {
            c.state == CandidateState::Succeeded
                && c.metrics.as_ref().is_some_and(|m| cond.satisfied_by(m))
        })
    }
}

/// In-memory projection of the event log.
///
/// `primary_metric` names the metric the termination condition declares; it
/// drives best-so-far selection. Folding is total: unknown event kinds and
/// malformed payloads are ignored so older logs remain readable.
pub struct StateStore {
    inner: RwLock<RuntimeSnapshot>,
    primary_metric: Option<String>,
}

impl StateStore {
    pub fn new(primary_metric: Option<String>) -> Self {
        Self {
            inner: RwLock::new(RuntimeSnapshot::default()),
            primary_metric,
        }
    }

    /// Build a store by folding `events` in order.
    pub fn replay(primary_metric: Option<String>, events: &[Event]) -> Self {
        let store = Self::new(primary_metric);
        for event in events {
            store.apply(event);
        }
        store
    }

    /// Return a consistent copy of the current state.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.inner.read().expect("state lock poisoned").clone()
    }

    /// Fold one event into the state.
    pub fn apply(&self, event: &Event) {
        let mut state = self.inner.write().expect("state lock poisoned");
        state.last_seq = state.last_seq.max(event.seq);

        match event.kind.as_str() {
            // A restart begins a fresh run over the same log: clear the
            // lifecycle flags and the failure streak.
            kind::RUNTIME_STARTED => {
                state.shutting_down = false;
                state.stopped = false;
                state.consecutive_failures = 0;
            }
            kind::RUNTIME_STOPPING => state.shutting_down = true,
            kind::RUNTIME_STOPPED => {
                state.shutting_down = true;
                state.stopped = true;
            }
            kind::CANDIDATE_CREATED => {
                let (Some(id), Some(payload)) =
                    (event.candidate_id, event.payload_as::<CreatedPayload>())
                else {
                    return;
                };
                state.candidates.insert(
                    id,
                    Candidate {
                        id,
                        parent_id: payload.parent_id,
                        branch: payload.branch,
                        worktree_path: payload.worktree_path,
                        state: CandidateState::Preparing,
                        created_at: event.ts,
                        finished_at: None,
                        metrics: None,
                        error: None,
                    },
                );
                state.active.insert(id);
            }
            kind::CANDIDATE_STAGE_STARTED => {
                let (Some(id), Some(payload)) =
                    (event.candidate_id, event.payload_as::<StagePayload>())
                else {
                    return;
                };
                if let Some(candidate) = state.candidates.get_mut(&id) {
                    if !candidate.state.is_terminal() {
                        candidate.state = match payload.stage {
                            Stage::Coding => CandidateState::Coding,
                            Stage::Presubmit => CandidateState::Presubmitting,
                            Stage::Evaluating => CandidateState::Evaluating,
                        };
                    }
                }
            }
            kind::CANDIDATE_EVALUATED => {
                let (Some(id), Some(payload)) =
                    (event.candidate_id, event.payload_as::<EvaluatedPayload>())
                else {
                    return;
                };
                let score = self
                    .primary_metric
                    .as_ref()
                    .and_then(|m| payload.metrics.get(m))
                    .copied();
                if let Some(candidate) = state.candidates.get_mut(&id) {
                    candidate.state = CandidateState::Succeeded;
                    candidate.metrics = Some(payload.metrics);
                    candidate.finished_at = Some(event.ts);
                }
                state.active.remove(&id);
                state.consecutive_failures = 0;

                // Replace the best only on a strictly higher score: events are
                // folded in seq order, so keeping the incumbent on a tie gives
                // the earliest finisher.
                if let Some(score) = score {
                    let current_best = state.best.and_then(|bid| {
                        let best = state.candidates.get(&bid)?;
                        let metric = self.primary_metric.as_ref()?;
                        best.metrics.as_ref()?.get(metric).copied()
                    });
                    if current_best.map_or(true, |b| score > b) {
                        state.best = Some(id);
                    }
                }
            }
            kind::CANDIDATE_FAILED => {
                let Some(id) = event.candidate_id else { return };
                let payload = event.payload_as::<FailedPayload>();
                if let Some(candidate) = state.candidates.get_mut(&id) {
                    candidate.state = CandidateState::Failed;
                    candidate.finished_at = Some(event.ts);
                    candidate.error = payload.map(|p| CandidateError {
                        kind: p.kind,
                        message: p.message,
                    });
                }
                state.active.remove(&id);
                state.consecutive_failures += 1;
            }
            kind::CANDIDATE_ABORTED => {
                let Some(id) = event.candidate_id else { return };
                if let Some(candidate) = state.candidates.get_mut(&id) {
                    candidate.state = CandidateState::Aborted;
                    candidate.finished_at = Some(event.ts);
                }
                state.active.remove(&id);
            }
            kind::TOOL_INVOKED => state.usage.tools_invoked += 1,
            kind::LLM_CALL => {
                if let Some(payload) = event.payload_as::<LlmCallPayload>() {
                    state.usage.llm_calls += 1;
                    if payload.cached {
                        state.usage.llm_calls_cached += 1;
                    }
                    state.usage.tokens_in += payload.tokens_in;
                    state.usage.tokens_out += payload.tokens_out;
                }
            }
            // Unknown kinds are tolerated so older logs remain readable.
            _ => {}
        }
    }
}
