//! Evaluator stage: run the evaluation command and parse metrics.
//!
//! The metrics contract is line-oriented: the *last* stdout line that parses
//! as a JSON object with numeric leaf values is the metrics map. Nested
//! objects are flattened with dot-joined keys. Anything else on stdout is
//! free-form evaluator chatter and ignored.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::config::EvaluatorSettings;
use crate::sandbox::{Sandbox, SandboxRequest};
use crate::stages::{tail, FailureKind, StageCapture, StageOutcome};

const ERROR_TAIL_CHARS: usize = 500;

/// Runs the evaluation command and extracts metrics.
pub struct EvaluatorStage {
    sandbox: Arc<dyn Sandbox>,
    settings: EvaluatorSettings,
    env: Vec<(String, String)>,
}

impl EvaluatorStage {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        settings: EvaluatorSettings,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            sandbox,
            settings,
            env,
        }
    }

    /// Run the evaluation in `worktree` and parse its stdout.
    pub async fn run(&self, candidate_id: u64, worktree: &Path) -> (StageOutcome, StageCapture) {
        let request = SandboxRequest::shell(
            &self.settings.command,
            worktree,
            Duration::from_secs(self.settings.timeout_s),
        )
        .with_env(self.env.clone());

        let result = match self.sandbox.run(request).await {
            Ok(result) => result,
            Err(e) => {
                return (
                    StageOutcome::failed(FailureKind::EvalError, format!("sandbox: {e}")),
                    StageCapture::default(),
                )
            }
        };

        let capture = StageCapture {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        };

        if result.timed_out {
            let message = format!(
                "evaluation timed out after {}s",
                self.settings.timeout_s
            );
            return (StageOutcome::failed(FailureKind::EvalError, message), capture);
        }

        if result.exit_code != 0 {
            let detail = if result.stderr.trim().is_empty() {
                &result.stdout
            } else {
                &result.stderr
            };
            let message = format!(
                "evaluation failed (exit {}): {}",
                result.exit_code,
                tail(detail, ERROR_TAIL_CHARS)
            );
            return (StageOutcome::failed(FailureKind::EvalError, message), capture);
        }

        match parse_metrics(&result.stdout) {
            MetricsParse::Metrics(metrics) => {
                info!(candidate_id, ?metrics, "evaluation completed");
                (StageOutcome::Metrics(metrics), capture)
            }
            MetricsParse::Empty => (
                StageOutcome::failed(
                    FailureKind::BadMetrics,
                    "metrics object contains no numeric values",
                ),
                capture,
            ),
            MetricsParse::NotFound => (
                StageOutcome::failed(
                    FailureKind::EvalError,
                    "no JSON metrics object found on stdout",
                ),
                capture,
            ),
        }
    }
}

enum MetricsParse {
    Metrics(BTreeMap<String, f64>),
    /// A JSON object was found but held no usable numbers.
    Empty,
    NotFound,
}

/// Scan stdout bottom-up for the last line that is a JSON object with
/// numeric leaves.
fn parse_metrics(stdout: &str) -> MetricsParse {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let mut metrics = BTreeMap::new();
        if flatten_into(&mut metrics, "", &map) {
            if metrics.is_empty() {
                return MetricsParse::Empty;
            }
            return MetricsParse::Metrics(metrics);
        }
        // An object with non-numeric leaves does not qualify; keep scanning
        // earlier lines.
    }
    MetricsParse::NotFound
}

/// Flatten `map` into dot-joined numeric leaves. Returns false if any leaf is
/// non-numeric or non-finite.
fn flatten_into(
    out: &mut BTreeMap<String, f64>,
    prefix: &str,
    map: &serde_json::Map<String, Value>,
) -> bool {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Number(n) => {
                let Some(number) = n.as_f64().filter(|f| f.is_finite()) else {
                    return false;
                };
                out.insert(name, number);
            }
            Value::Object(nested) => {
                if !flatten_into(out, &name, nested) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandbox;

    fn stage(command: &str) -> EvaluatorStage {
        EvaluatorStage::new(
            Arc::new(LocalSandbox::new()),
            EvaluatorSettings {
                command: command.to_string(),
                timeout_s: 30,
                script: "evaluate.py".to_string(),
            },
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn last_json_line_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let command = r#"echo 'running...'; echo '{"accuracy": 0.2}'; echo '{"accuracy": 0.9}'"#;
        let (outcome, _) = stage(command).run(1, dir.path()).await;

        match outcome {
            StageOutcome::Metrics(metrics) => assert_eq!(metrics["accuracy"], 0.9),
            other => panic!("expected metrics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chatter_after_metrics_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let command = r#"echo '{"score": 1.5}'; echo 'done!'"#;
        let (outcome, _) = stage(command).run(1, dir.path()).await;
        match outcome {
            StageOutcome::Metrics(metrics) => assert_eq!(metrics["score"], 1.5),
            other => panic!("expected metrics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_metrics_is_eval_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (outcome, _) = stage("echo nothing to see").run(1, dir.path()).await;
        match outcome {
            StageOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::EvalError),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_eval_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (outcome, _) = stage(r#"echo '{"accuracy": 1.0}'; exit 2"#)
            .run(1, dir.path())
            .await;
        match outcome {
            StageOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::EvalError),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn nested_objects_flatten_with_dots() {
        let stdout = r#"{"outer": {"inner": 2.0}, "flat": 1.0}"#;
        match parse_metrics(stdout) {
            MetricsParse::Metrics(metrics) => {
                assert_eq!(metrics["outer.inner"], 2.0);
                assert_eq!(metrics["flat"], 1.0);
            }
            _ => panic!("expected metrics"),
        }
    }

    #[test]
    fn non_numeric_leaves_disqualify_the_line() {
        // The later object has a string leaf; the earlier one qualifies.
        let stdout = "{\"accuracy\": 0.5}\n{\"status\": \"ok\"}";
        match parse_metrics(stdout) {
            MetricsParse::Metrics(metrics) => assert_eq!(metrics["accuracy"], 0.5),
            _ => panic!("expected metrics from earlier line"),
        }
    }

    #[test]
    fn empty_object_is_bad_metrics() {
        match parse_metrics("{}") {
            MetricsParse::Empty => {}
            _ => panic!("expected empty-metrics detection"),
        }
    }

    #[test]
    fn json_arrays_do_not_qualify() {
        match parse_metrics("[1, 2, 3]") {
            MetricsParse::NotFound => {}
            _ => panic!("expected not-found"),
        }
    }
}
