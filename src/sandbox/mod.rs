//! Sandboxed command execution.
//!
//! A sandbox runs one command against one worktree and reports exit code,
//! captured output, and whether the wall-clock timeout fired. The engine
//! holds the sandbox as an injected capability: the Docker implementation is
//! used for real runs, the local subprocess implementation for mock mode and
//! tests.

pub mod docker;
pub mod local;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;

/// One command to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Worktree mounted (or used) as the working directory.
    pub worktree: PathBuf,
    /// Environment to expose, already reduced to the configured allowlist.
    pub env: Vec<(String, String)>,
    /// Wall-clock limit; the command is killed when it elapses.
    pub timeout: Duration,
}

impl SandboxRequest {
    /// Convenience constructor for a `sh -c` shell command.
    pub fn shell(command: &str, worktree: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            worktree: worktree.into(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Outcome of a sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl SandboxResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Container or subprocess execution context for one command at a time.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run a command to completion (or timeout) and capture its output.
    async fn run(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError>;

    /// Probe availability (e.g. the Docker daemon). Called once per tick
    /// while the sandbox is suspected down.
    async fn check(&self) -> Result<(), SandboxError>;

    /// Kill every live execution. Called on engine shutdown.
    async fn kill_all(&self);
}

/// Reduce the host environment to the allowlisted names.
///
/// Nothing outside the allowlist is ever forwarded into a sandbox.
pub fn allowlisted_env(allowlist: &[String]) -> Vec<(String, String)> {
    allowlist
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_filters_host_env() {
        std::env::set_var("AURELIA_TEST_FORWARDED", "yes");
        std::env::set_var("AURELIA_TEST_HIDDEN", "no");

        let env = allowlisted_env(&[
            "AURELIA_TEST_FORWARDED".to_string(),
            "AURELIA_TEST_ABSENT".to_string(),
        ]);
        assert_eq!(
            env,
            vec![("AURELIA_TEST_FORWARDED".to_string(), "yes".to_string())]
        );
    }

    #[test]
    fn shell_request_builds_sh_argv() {
        let req = SandboxRequest::shell("echo hi", "/tmp", Duration::from_secs(5));
        assert_eq!(req.argv, vec!["sh", "-c", "echo hi"]);
    }
}
