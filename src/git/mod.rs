//! Git subprocess wrapper.
//!
//! All repository operations shell out to the `git` binary; stderr is
//! captured into errors so candidate-scoped git failures carry a usable
//! message.

pub mod worktree;

pub use worktree::{Worktree, WorktreeManager};

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::GitError;

/// Handle to a git repository rooted at a fixed directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Verify that `root` actually is a git repository.
    pub async fn check(&self) -> Result<(), GitError> {
        self.run(&["rev-parse", "--git-dir"])
            .await
            .map(|_| ())
            .map_err(|_| GitError::NotARepository(self.root.display().to_string()))
    }

    /// Resolve a ref (e.g. `HEAD` or a branch name) to a commit sha.
    pub async fn rev_parse(&self, reference: &str) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", reference]).await?;
        Ok(out.trim().to_string())
    }

    /// Whether `branch` exists as a local branch.
    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{branch}");
        match self.run(&["show-ref", "--verify", "--quiet", &reference]).await {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Force-delete a local branch. Missing branches are not an error.
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        match self.run(&["branch", "-D", branch]).await {
            Ok(_) => Ok(()),
            Err(GitError::CommandFailed { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run a git subcommand in the repository root, returning stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        debug!(args = ?args, root = %self.root.display(), "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(GitError::Spawn)?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod test_repo {
    use super::*;

    /// Create a scratch repository with one commit, for tests.
    pub async fn init(dir: &Path) -> GitRepo {
        let repo = GitRepo::new(dir);
        run_in(dir, &["init", "-b", "main"]).await;
        run_in(dir, &["config", "user.email", "test@example.com"]).await;
        run_in(dir, &["config", "user.name", "test"]).await;
        std::fs::write(dir.join("README.md"), "# test project\n").expect("write readme");
        run_in(dir, &["add", "."]).await;
        run_in(dir, &["commit", "-m", "initial"]).await;
        repo
    }

    async fn run_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }
}
