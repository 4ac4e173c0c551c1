//! Per-candidate state machine.
//!
//! One candidate moves linearly through preparing → coding → presubmitting →
//! evaluating, ending in succeeded, failed, or aborted. Every transition is
//! recorded as events before anything else observes it, each stage runs at
//! most once, and cooperative cancellation is checked at every stage
//! boundary. All candidate-scoped errors are captured here and surface as
//! exactly one `candidate_failed` event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::EventLogError;
use crate::events::{CreatedPayload, Event, Stage};
use crate::git::{GitRepo, WorktreeManager, Worktree};
use crate::journal::Journal;
use crate::llm::LlmClient;
use crate::sandbox::{allowlisted_env, Sandbox};
use crate::signals::Shutdown;
use crate::stages::{
    CoderStage, EvaluatorStage, FailureKind, PresubmitStage, StageCapture, StageOutcome,
};
use crate::stages::coder::CoderContext;
use crate::tools::ToolServer;

/// Runs candidates end to end; shared by all scheduler tasks.
pub struct CandidateEngine {
    journal: Arc<Journal>,
    worktrees: Arc<WorktreeManager>,
    sandbox: Arc<dyn Sandbox>,
    llm: Arc<dyn LlmClient>,
    config: Arc<RuntimeConfig>,
    shutdown: Shutdown,
    project_dir: PathBuf,
    logs_dir: PathBuf,
}

impl CandidateEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        journal: Arc<Journal>,
        worktrees: Arc<WorktreeManager>,
        sandbox: Arc<dyn Sandbox>,
        llm: Arc<dyn LlmClient>,
        config: Arc<RuntimeConfig>,
        shutdown: Shutdown,
        project_dir: PathBuf,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            journal,
            worktrees,
            sandbox,
            llm,
            config,
            shutdown,
            project_dir,
            logs_dir,
        }
    }

    /// Drive candidate `id` from creation to a terminal state.
    ///
    /// `parent` is the succeeded candidate to fork from, or `None` to fork
    /// the project HEAD. Only event-log write failures propagate; everything
    /// candidate-scoped resolves to terminal events.
    pub async fn run(&self, id: u64, parent: Option<(u64, String)>) -> Result<(), EventLogError> {
        let parent_ref = parent
            .as_ref()
            .map(|(_, branch)| branch.clone())
            .unwrap_or_else(|| "HEAD".to_string());
        let branch = WorktreeManager::branch_name(id);
        let worktree_path = self.worktrees.path_for(id);

        self.journal.record(Event::candidate_created(
            id,
            CreatedPayload {
                parent_id: parent.as_ref().map(|(pid, _)| *pid),
                branch: branch.clone(),
                worktree_path: worktree_path.display().to_string(),
            },
        ))?;
        info!(candidate_id = id, parent = %parent_ref, "candidate created");

        if self.shutdown.is_triggered() {
            self.journal.record(Event::candidate_aborted(id))?;
            return Ok(());
        }

        let worktree = match self.worktrees.create(id, &parent_ref).await {
            Ok(worktree) => worktree,
            Err(e) => {
                warn!(candidate_id = id, error = %e, "worktree creation failed");
                self.journal.record(Event::candidate_failed(
                    id,
                    FailureKind::GitError.as_str(),
                    &e.to_string(),
                ))?;
                return Ok(());
            }
        };

        let result = self.run_stages(id, &worktree).await;
        match result {
            Ok(keep_branch) => {
                if let Err(e) = self.worktrees.destroy(&worktree, keep_branch).await {
                    warn!(candidate_id = id, error = %e, "worktree cleanup failed");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the three stages. Returns whether the candidate's branch should
    /// outlive the worktree (true only for succeeded candidates).
    async fn run_stages(&self, id: u64, worktree: &Worktree) -> Result<bool, EventLogError> {
        let env = allowlisted_env(&self.config.sandbox.env_forward);

        // -- coding --
        self.journal.record(Event::stage_started(id, Stage::Coding))?;
        let tools = ToolServer::new(
            worktree.path.clone(),
            self.sandbox.clone(),
            env.clone(),
            Duration::from_secs(self.config.coder.tool_timeout_s),
            self.journal.clone(),
            id,
        );
        let coder = CoderStage::new(
            self.llm.clone(),
            self.config.coder.clone(),
            self.shutdown.clone(),
        );
        let (outcome, capture) = coder
            .run(CoderContext {
                candidate_id: id,
                tools: &tools,
                journal: self.journal.clone(),
                problem_statement: self.read_project_file("README.md"),
                eval_script: self.read_project_file(&self.config.evaluator.script),
                prior_outcomes: self.prior_outcomes(),
            })
            .await;
        self.write_stage_logs(id, "coder", &capture);
        self.journal
            .record(Event::stage_finished(id, Stage::Coding, outcome.label()))?;
        match outcome {
            StageOutcome::Ok => {}
            StageOutcome::Failed { kind, message } => {
                self.journal
                    .record(Event::candidate_failed(id, kind.as_str(), &message))?;
                return Ok(false);
            }
            StageOutcome::Aborted => {
                self.journal.record(Event::candidate_aborted(id))?;
                return Ok(false);
            }
            StageOutcome::Metrics(_) => unreachable!("coder never yields metrics"),
        }

        // Persist the edits on the candidate branch so children can fork it.
        if let Err(e) = self.commit_worktree(id, worktree).await {
            self.journal.record(Event::candidate_failed(
                id,
                FailureKind::GitError.as_str(),
                &e.to_string(),
            ))?;
            return Ok(false);
        }

        if self.shutdown.is_triggered() {
            self.journal.record(Event::candidate_aborted(id))?;
            return Ok(false);
        }

        // -- presubmit --
        self.journal
            .record(Event::stage_started(id, Stage::Presubmit))?;
        let presubmit = PresubmitStage::new(
            self.sandbox.clone(),
            self.config.presubmit.clone(),
            env.clone(),
        );
        let (outcome, capture) = presubmit.run(id, &worktree.path).await;
        self.write_stage_logs(id, "presubmit", &capture);
        self.journal.record(Event::stage_finished(
            id,
            Stage::Presubmit,
            outcome.label(),
        ))?;
        match outcome {
            StageOutcome::Ok => {}
            StageOutcome::Failed { kind, message } => {
                self.journal
                    .record(Event::candidate_failed(id, kind.as_str(), &message))?;
                return Ok(false);
            }
            StageOutcome::Aborted => {
                self.journal.record(Event::candidate_aborted(id))?;
                return Ok(false);
            }
            StageOutcome::Metrics(_) => unreachable!("presubmit never yields metrics"),
        }

        if self.shutdown.is_triggered() {
            self.journal.record(Event::candidate_aborted(id))?;
            return Ok(false);
        }

        // -- evaluating --
        self.journal
            .record(Event::stage_started(id, Stage::Evaluating))?;
        let evaluator = EvaluatorStage::new(
            self.sandbox.clone(),
            self.config.evaluator.clone(),
            env,
        );
        let (outcome, capture) = evaluator.run(id, &worktree.path).await;
        self.write_stage_logs(id, "evaluator", &capture);
        self.journal.record(Event::stage_finished(
            id,
            Stage::Evaluating,
            outcome.label(),
        ))?;
        match outcome {
            StageOutcome::Metrics(metrics) => {
                info!(candidate_id = id, ?metrics, "candidate succeeded");
                self.journal
                    .record(Event::candidate_evaluated(id, metrics))?;
                Ok(true)
            }
            StageOutcome::Failed { kind, message } => {
                self.journal
                    .record(Event::candidate_failed(id, kind.as_str(), &message))?;
                Ok(false)
            }
            StageOutcome::Aborted => {
                self.journal.record(Event::candidate_aborted(id))?;
                Ok(false)
            }
            StageOutcome::Ok => unreachable!("evaluator yields metrics or failure"),
        }
    }

    /// Commit whatever the coder changed onto the candidate branch.
    async fn commit_worktree(&self, id: u64, worktree: &Worktree) -> Result<(), crate::error::GitError> {
        let repo = GitRepo::new(&worktree.path);
        let status = repo.run(&["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(());
        }
        repo.run(&["add", "-A"]).await?;
        let message = format!("candidate {id}");
        repo.run(&[
            "-c",
            "user.email=aurelia@localhost",
            "-c",
            "user.name=aurelia",
            "commit",
            "-m",
            &message,
        ])
        .await?;
        Ok(())
    }

    /// Per-attempt feedback for the coder prompt: ids, metrics, error kinds.
    fn prior_outcomes(&self) -> String {
        let snapshot = self.journal.snapshot();
        let mut lines = Vec::new();
        for candidate in snapshot.candidates.values() {
            if !candidate.state.is_terminal() {
                continue;
            }
            let line = match (&candidate.metrics, &candidate.error) {
                (Some(metrics), _) => format!(
                    "candidate {}: succeeded metrics={}",
                    candidate.id,
                    serde_json::to_string(metrics).unwrap_or_default()
                ),
                (None, Some(error)) => {
                    format!("candidate {}: failed ({})", candidate.id, error.kind)
                }
                (None, None) => format!("candidate {}: {:?}", candidate.id, candidate.state),
            };
            lines.push(line);
        }
        lines.join("\n")
    }

    fn read_project_file(&self, relpath: &str) -> String {
        std::fs::read_to_string(self.project_dir.join(relpath)).unwrap_or_default()
    }

    fn write_stage_logs(&self, id: u64, stage: &str, capture: &StageCapture) {
        let dir = self.logs_dir.join(id.to_string());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(candidate_id = id, error = %e, "cannot create log dir");
            return;
        }
        let _ = std::fs::write(dir.join(format!("{stage}.stdout")), &capture.stdout);
        let _ = std::fs::write(dir.join(format!("{stage}.stderr")), &capture.stderr);
    }
}
