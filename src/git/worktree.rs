//! Worktree lifecycle for candidate branches.
//!
//! Every candidate gets its own branch (`aurelia/<id>`) and an isolated
//! worktree under `.aurelia/worktrees/<id>`, so concurrent candidates never
//! contend for a checkout. Operations are idempotent: a half-created or
//! half-removed worktree is repaired on the next call, and orphans left by a
//! crash are swept at startup.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::GitError;
use crate::git::GitRepo;

/// Branch namespace for candidate branches.
const BRANCH_PREFIX: &str = "aurelia/";

/// Creates and destroys per-candidate worktrees.
pub struct WorktreeManager {
    repo: GitRepo,
    base: PathBuf,
}

/// A created worktree: the branch it checks out and its filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub branch: String,
    pub path: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo: GitRepo, base: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            base: base.into(),
        }
    }

    /// The branch name owned by candidate `id`.
    pub fn branch_name(id: u64) -> String {
        format!("{BRANCH_PREFIX}{id}")
    }

    /// The worktree path candidate `id` will occupy.
    pub fn path_for(&self, id: u64) -> PathBuf {
        self.base.join(id.to_string())
    }

    /// Create a branch from `parent_ref` and add a worktree for it.
    ///
    /// `parent_ref` is the project `HEAD` for the first candidate or the
    /// branch of a succeeded parent candidate. Leftovers from an interrupted
    /// previous attempt at the same path are cleared first.
    pub async fn create(&self, id: u64, parent_ref: &str) -> Result<Worktree, GitError> {
        let branch = Self::branch_name(id);
        let path = self.base.join(id.to_string());

        if path.exists() {
            self.force_remove(&path).await;
        }
        if self.repo.branch_exists(&branch).await? {
            self.repo.delete_branch(&branch).await?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.display().to_string();
        self.repo
            .run(&["worktree", "add", "-b", &branch, &path_str, parent_ref])
            .await?;
        info!(branch = %branch, path = %path_str, parent = parent_ref, "worktree created");

        Ok(Worktree { branch, path })
    }

    /// Remove the worktree at `path`.
    ///
    /// On success outcomes the branch is kept (it may become a parent); on
    /// failure outcomes the branch is deleted along with the worktree.
    pub async fn destroy(&self, worktree: &Worktree, keep_branch: bool) -> Result<(), GitError> {
        self.force_remove(&worktree.path).await;
        if !keep_branch {
            self.repo.delete_branch(&worktree.branch).await?;
        }
        self.repo.run(&["worktree", "prune"]).await?;
        info!(branch = %worktree.branch, keep_branch, "worktree destroyed");
        Ok(())
    }

    /// Sweep worktrees under the base directory that git still registers.
    ///
    /// Called at startup: candidates are never resumed after a crash, so
    /// every worktree under our base is an orphan. Branches are kept —
    /// succeeded candidates' branches may be parents of future work.
    pub async fn prune_orphans(&self) -> Result<usize, GitError> {
        self.repo.run(&["worktree", "prune"]).await?;

        let mut removed = 0;
        for path in self.registered_paths().await? {
            if path.starts_with(&self.base) {
                warn!(path = %path.display(), "removing orphaned worktree");
                self.force_remove(&path).await;
                removed += 1;
            }
        }

        // Clear unregistered directory litter as well.
        if self.base.exists() {
            if let Ok(entries) = std::fs::read_dir(&self.base) {
                for entry in entries.flatten() {
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }
        self.repo.run(&["worktree", "prune"]).await?;
        Ok(removed)
    }

    /// Paths of all registered worktrees (excluding the main checkout).
    async fn registered_paths(&self) -> Result<Vec<PathBuf>, GitError> {
        let raw = self.repo.run(&["worktree", "list", "--porcelain"]).await?;
        let mut paths = Vec::new();
        for line in raw.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                let path = PathBuf::from(p.trim());
                if path != self.repo.root() {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    async fn force_remove(&self, path: &Path) {
        let path_str = path.display().to_string();
        if let Err(e) = self
            .repo
            .run(&["worktree", "remove", "--force", &path_str])
            .await
        {
            // Not registered (already pruned, or never fully added) — fall
            // back to removing the directory itself.
            warn!(path = %path_str, error = %e, "git worktree remove failed; deleting directory");
        }
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
    }
}
