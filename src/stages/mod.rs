//! Candidate stages: coder, presubmit, evaluator.
//!
//! Stages never raise candidate-scoped failures as errors; they resolve to
//! outcome values the candidate engine turns into events. Captured
//! stdout/stderr is handed back so the engine can persist per-stage logs.

pub mod coder;
pub mod evaluator;
pub mod presubmit;

pub use coder::CoderStage;
pub use evaluator::EvaluatorStage;
pub use presubmit::PresubmitStage;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Domain-level failure kinds recorded on `candidate_failed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    GitError,
    CoderTurnBudget,
    CoderToolError,
    PresubmitFail,
    EvalError,
    BadMetrics,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::GitError => "git_error",
            FailureKind::CoderTurnBudget => "coder_turn_budget",
            FailureKind::CoderToolError => "coder_tool_error",
            FailureKind::PresubmitFail => "presubmit_fail",
            FailureKind::EvalError => "eval_error",
            FailureKind::BadMetrics => "bad_metrics",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output captured from a stage, persisted under
/// `.aurelia/logs/<candidate_id>/<stage>.{stdout,stderr}`.
#[derive(Debug, Clone, Default)]
pub struct StageCapture {
    pub stdout: String,
    pub stderr: String,
}

/// Result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Stage completed; the candidate advances.
    Ok,
    /// Evaluation completed with parsed metrics.
    Metrics(BTreeMap<String, f64>),
    /// Candidate-scoped failure; terminal for the candidate.
    Failed { kind: FailureKind, message: String },
    /// Cooperative cancellation was observed.
    Aborted,
}

impl StageOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        StageOutcome::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Short label for `candidate_stage_finished` events.
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Ok | StageOutcome::Metrics(_) => "ok",
            StageOutcome::Failed { .. } => "failed",
            StageOutcome::Aborted => "aborted",
        }
    }
}

/// Last `max_chars` of a stream, for failure messages.
pub(crate) fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}
