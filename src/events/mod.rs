//! Event records for the append-only log.
//!
//! Every state change in the runtime is captured as an [`Event`] appended to
//! the durable log; the in-memory state is a pure fold of these records. The
//! wire format keeps `kind` as a plain string and `payload` as a JSON object
//! so that readers of old logs can skip kinds they do not know.

pub mod log;

pub use log::EventLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Event kind names as they appear on the wire.
pub mod kind {
    pub const RUNTIME_STARTED: &str = "runtime_started";
    pub const RUNTIME_STOPPING: &str = "runtime_stopping";
    pub const RUNTIME_STOPPED: &str = "runtime_stopped";
    pub const CANDIDATE_CREATED: &str = "candidate_created";
    pub const CANDIDATE_STAGE_STARTED: &str = "candidate_stage_started";
    pub const CANDIDATE_STAGE_FINISHED: &str = "candidate_stage_finished";
    pub const CANDIDATE_EVALUATED: &str = "candidate_evaluated";
    pub const CANDIDATE_FAILED: &str = "candidate_failed";
    pub const CANDIDATE_ABORTED: &str = "candidate_aborted";
    pub const TOOL_INVOKED: &str = "tool_invoked";
    pub const LLM_CALL: &str = "llm_call";
}

/// A bounded phase of a candidate's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Coding,
    Presubmit,
    Evaluating,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Coding => "coding",
            Stage::Presubmit => "presubmit",
            Stage::Evaluating => "evaluating",
        };
        write!(f, "{name}")
    }
}

/// A single entry in the append-only event log.
///
/// Required wire keys are `seq`, `ts`, and `kind`; `candidate_id` and
/// `payload` are optional. Events are written exactly once and never
/// amended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, assigned by the log on append.
    pub seq: u64,
    /// Wall-clock timestamp (RFC 3339 on the wire).
    pub ts: DateTime<Utc>,
    /// Event kind name; see [`kind`].
    pub kind: String,
    /// Candidate this event belongs to, when candidate-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<u64>,
    /// Kind-specific payload object.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Event {
    fn new(kind: &str, candidate_id: Option<u64>, payload: Value) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            kind: kind.to_string(),
            candidate_id,
            payload,
        }
    }

    pub fn runtime_started(pid: u32) -> Self {
        Self::new(
            kind::RUNTIME_STARTED,
            None,
            serde_json::json!({ "pid": pid }),
        )
    }

    pub fn runtime_stopping(reason: &str) -> Self {
        Self::new(
            kind::RUNTIME_STOPPING,
            None,
            serde_json::json!({ "reason": reason }),
        )
    }

    pub fn runtime_stopped() -> Self {
        Self::new(kind::RUNTIME_STOPPED, None, Value::Null)
    }

    pub fn candidate_created(id: u64, payload: CreatedPayload) -> Self {
        Self::new(kind::CANDIDATE_CREATED, Some(id), to_value(&payload))
    }

    pub fn stage_started(id: u64, stage: Stage) -> Self {
        Self::new(
            kind::CANDIDATE_STAGE_STARTED,
            Some(id),
            to_value(&StagePayload {
                stage,
                outcome: None,
            }),
        )
    }

    pub fn stage_finished(id: u64, stage: Stage, outcome: &str) -> Self {
        Self::new(
            kind::CANDIDATE_STAGE_FINISHED,
            Some(id),
            to_value(&StagePayload {
                stage,
                outcome: Some(outcome.to_string()),
            }),
        )
    }

    pub fn candidate_evaluated(id: u64, metrics: BTreeMap<String, f64>) -> Self {
        Self::new(
            kind::CANDIDATE_EVALUATED,
            Some(id),
            to_value(&EvaluatedPayload { metrics }),
        )
    }

    pub fn candidate_failed(id: u64, failure_kind: &str, message: &str) -> Self {
        Self::new(
            kind::CANDIDATE_FAILED,
            Some(id),
            to_value(&FailedPayload {
                kind: failure_kind.to_string(),
                message: message.to_string(),
            }),
        )
    }

    pub fn candidate_aborted(id: u64) -> Self {
        Self::new(kind::CANDIDATE_ABORTED, Some(id), Value::Null)
    }

    pub fn tool_invoked(id: u64, name: &str, summary: &str) -> Self {
        Self::new(
            kind::TOOL_INVOKED,
            Some(id),
            to_value(&ToolInvokedPayload {
                name: name.to_string(),
                summary: summary.to_string(),
            }),
        )
    }

    pub fn llm_call(id: u64, tokens_in: u64, tokens_out: u64, cached: bool) -> Self {
        Self::new(
            kind::LLM_CALL,
            Some(id),
            to_value(&LlmCallPayload {
                tokens_in,
                tokens_out,
                cached,
            }),
        )
    }

    /// Deserialize the payload into a typed struct, if it matches.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    // Payload structs contain only strings, numbers, and maps; serialization
    // cannot fail for them.
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Payload of `candidate_created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    pub branch: String,
    pub worktree_path: String,
}

/// Payload of `candidate_stage_started` / `candidate_stage_finished`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Payload of `candidate_evaluated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedPayload {
    pub metrics: BTreeMap<String, f64>,
}

/// Payload of `candidate_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub kind: String,
    pub message: String,
}

/// Payload of `tool_invoked`. Carries a summary, never raw contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvokedPayload {
    pub name: String,
    pub summary: String,
}

/// Payload of `llm_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallPayload {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached: bool,
}
