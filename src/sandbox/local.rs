//! Host-subprocess sandbox for mock mode and tests.
//!
//! Runs commands directly on the host in the worktree directory, each in its
//! own process group so a timeout or shutdown can kill the whole tree. This
//! trades the container isolation boundary for hermetic, Docker-free runs;
//! the environment allowlist is still honored on top of the inherited host
//! environment.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::sandbox::{Sandbox, SandboxRequest, SandboxResult};

/// Sandbox that runs commands as host subprocesses.
#[derive(Default)]
pub struct LocalSandbox {
    live_groups: Mutex<HashSet<i32>>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn kill_group(pgid: i32) {
        let pid = Pid::from_raw(pgid);
        if killpg(pid, Signal::SIGTERM).is_err() {
            return;
        }
        let _ = killpg(pid, Signal::SIGKILL);
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::Launch("empty argv".to_string()))?;

        debug!(argv = ?request.argv, worktree = %request.worktree.display(), "local sandbox run");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&request.worktree)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let child = command
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("spawn {program}: {e}")))?;
        let pgid = child.id().map(|id| id as i32);
        if let Some(pgid) = pgid {
            self.live_groups
                .lock()
                .expect("live groups lock poisoned")
                .insert(pgid);
        }

        let outcome = tokio::time::timeout(request.timeout, child.wait_with_output()).await;

        if let Some(pgid) = pgid {
            self.live_groups
                .lock()
                .expect("live groups lock poisoned")
                .remove(&pgid);
        }

        match outcome {
            Ok(Ok(output)) => Ok(SandboxResult {
                exit_code: output.status.code().unwrap_or(-1) as i64,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                warn!(argv = ?request.argv, timeout = ?request.timeout, "local sandbox timed out");
                if let Some(pgid) = pgid {
                    Self::kill_group(pgid);
                }
                Ok(SandboxResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("timed out after {:?}", request.timeout),
                    timed_out: true,
                })
            }
        }
    }

    async fn check(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn kill_all(&self) {
        let groups: Vec<i32> = self
            .live_groups
            .lock()
            .expect("live groups lock poisoned")
            .iter()
            .copied()
            .collect();
        for pgid in groups {
            warn!(pgid, "killing live sandbox process group on shutdown");
            Self::kill_group(pgid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::new();

        let result = sandbox
            .run(SandboxRequest::shell(
                "echo out; echo err >&2; exit 3",
                dir.path(),
                Duration::from_secs(10),
            ))
            .await
            .expect("run");

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn timeout_kills_and_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::new();

        let result = sandbox
            .run(SandboxRequest::shell(
                "sleep 30",
                dir.path(),
                Duration::from_millis(100),
            ))
            .await
            .expect("run");

        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn runs_in_worktree_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "here").expect("write");
        let sandbox = LocalSandbox::new();

        let result = sandbox
            .run(SandboxRequest::shell(
                "cat marker.txt",
                dir.path(),
                Duration::from_secs(10),
            ))
            .await
            .expect("run");

        assert_eq!(result.stdout, "here");
    }
}
