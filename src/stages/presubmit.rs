//! Presubmit stage: cheap checks before the expensive evaluation.
//!
//! Runs the configured check command in the candidate worktree via the
//! sandbox. A non-zero exit is an expected outcome (`presubmit_fail`), not
//! an engine error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::PresubmitSettings;
use crate::sandbox::{Sandbox, SandboxRequest};
use crate::stages::{tail, FailureKind, StageCapture, StageOutcome};

const STDERR_TAIL_CHARS: usize = 500;

/// Runs the presubmit check command.
pub struct PresubmitStage {
    sandbox: Arc<dyn Sandbox>,
    settings: PresubmitSettings,
    env: Vec<(String, String)>,
}

impl PresubmitStage {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        settings: PresubmitSettings,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            sandbox,
            settings,
            env,
        }
    }

    /// Run the check in `worktree`. Pass iff the exit code is zero.
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
                    StageOutcome::failed(FailureKind::PresubmitFail, format!("sandbox: {e}")),
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
                "check '{}' timed out after {}s",
                self.settings.command, self.settings.timeout_s
            );
            return (
                StageOutcome::failed(FailureKind::PresubmitFail, message),
                capture,
            );
        }

        if result.exit_code != 0 {
            let detail = if result.stderr.trim().is_empty() {
                &result.stdout
            } else {
                &result.stderr
            };
            let message = format!(
                "check '{}' failed (exit {}): {}",
                self.settings.command,
                result.exit_code,
                tail(detail, STDERR_TAIL_CHARS)
            );
            return (
                StageOutcome::failed(FailureKind::PresubmitFail, message),
                capture,
            );
        }

        info!(candidate_id, command = %self.settings.command, "presubmit passed");
        (StageOutcome::Ok, capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandbox;

    fn stage(command: &str, timeout_s: u64) -> PresubmitStage {
        PresubmitStage::new(
            Arc::new(LocalSandbox::new()),
            PresubmitSettings {
                command: command.to_string(),
                timeout_s,
            },
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn zero_exit_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (outcome, _) = stage("true", 30).run(1, dir.path()).await;
        assert_eq!(outcome, StageOutcome::Ok);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (outcome, capture) = stage("echo broken >&2; exit 1", 30).run(1, dir.path()).await;

        match outcome {
            StageOutcome::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::PresubmitFail);
                assert!(message.contains("broken"));
                assert!(message.contains("exit 1"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(capture.stderr.contains("broken"));
    }

    #[tokio::test]
    async fn timeout_fails_the_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (outcome, _) = stage("sleep 30", 0).run(1, dir.path()).await;
        match outcome {
            StageOutcome::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::PresubmitFail);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
