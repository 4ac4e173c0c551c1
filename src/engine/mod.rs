//! Engine wiring and runtime lifecycle.
//!
//! `Runtime` owns every collaborator — journal, worktree manager, sandbox,
//! LLM client — injected as values at construction (no global state). It
//! performs startup recovery, writes the pid file, installs signal handlers,
//! runs the heartbeat scheduler, and cleans up on the way out.

pub mod candidate;
pub mod scheduler;

pub use candidate::CandidateEngine;
pub use scheduler::{HeartbeatScheduler, StopReason};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, EventLogError, GitError, SandboxError};
use crate::events::{Event, EventLog};
use crate::git::{GitRepo, WorktreeManager};
use crate::ids::IdGenerator;
use crate::journal::Journal;
use crate::llm::{CachedLlmClient, LlmClient, MockLlmClient};
use crate::sandbox::{DockerSandbox, LocalSandbox, Sandbox};
use crate::signals::{install_handlers, Shutdown};
use crate::state::StateStore;

/// Engine-scoped fatal errors. Candidate-scoped failures never reach here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("project is not initialized (run `aurelia init` first)")]
    NotInitialized,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SandboxError> for EngineError {
    fn from(e: SandboxError) -> Self {
        EngineError::SandboxUnavailable(e.to_string())
    }
}

/// Options controlling how the runtime is assembled.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Use the mock LLM client and the local subprocess sandbox.
    pub mock: bool,
    /// Install SIGTERM/SIGINT handlers. Disabled in tests.
    pub handle_signals: bool,
}

/// The assembled engine.
pub struct Runtime {
    project_dir: PathBuf,
    aurelia_dir: PathBuf,
    config: Arc<RuntimeConfig>,
    journal: Arc<Journal>,
    ids: Arc<IdGenerator>,
    worktrees: Arc<WorktreeManager>,
    sandbox: Arc<dyn Sandbox>,
    llm: Arc<dyn LlmClient>,
    shutdown: Shutdown,
    handle_signals: bool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("project_dir", &self.project_dir)
            .field("aurelia_dir", &self.aurelia_dir)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Assemble the engine with default collaborators.
    ///
    /// With `options.mock` the LLM is the scripted mock and the sandbox runs
    /// host subprocesses; otherwise the Docker sandbox is used. Mock mode
    /// always schedules with the default dispatch policy.
    pub fn build(project_dir: &Path, options: RuntimeOptions) -> Result<Self, EngineError> {
        let sandbox: Arc<dyn Sandbox>;
        let llm: Arc<dyn LlmClient>;

        let aurelia_dir = project_dir.join(".aurelia");
        if !aurelia_dir.exists() {
            return Err(EngineError::NotInitialized);
        }
        let config = RuntimeConfig::load(&aurelia_dir)?;

        if options.mock {
            if config.dispatcher == crate::config::Dispatcher::Planner {
                warn!("mock mode forces the default dispatcher");
            }
            sandbox = Arc::new(LocalSandbox::new());
            llm = Arc::new(CachedLlmClient::new(Arc::new(MockLlmClient::scripted(
                Vec::new(),
            ))));
            info!("running with mock LLM client and local sandbox");
        } else {
            sandbox = Arc::new(DockerSandbox::connect(config.sandbox.clone())?);
            // The remote transport is supplied externally; until one is
            // injected, runs must use --mock.
            llm = Arc::new(CachedLlmClient::new(Arc::new(MockLlmClient::scripted(
                Vec::new(),
            ))));
        }

        Self::with_collaborators(project_dir, config, sandbox, llm, options.handle_signals)
    }

    /// Assemble the engine with injected collaborators (used by tests).
    pub fn with_collaborators(
        project_dir: &Path,
        config: RuntimeConfig,
        sandbox: Arc<dyn Sandbox>,
        llm: Arc<dyn LlmClient>,
        handle_signals: bool,
    ) -> Result<Self, EngineError> {
        let project_dir = project_dir.to_path_buf();
        let aurelia_dir = project_dir.join(".aurelia");
        if !aurelia_dir.exists() {
            return Err(EngineError::NotInitialized);
        }

        let log = EventLog::open(aurelia_dir.join("events.jsonl"))?;
        let history = log.scan()?;
        let ids = Arc::new(IdGenerator::seeded_from(&history));
        let primary_metric = config.termination()?.map(|c| c.metric);
        let store = StateStore::replay(primary_metric, &history);
        let journal = Journal::new(log, store);

        let repo = GitRepo::new(&project_dir);
        let worktrees = Arc::new(WorktreeManager::new(repo, aurelia_dir.join("worktrees")));

        Ok(Self {
            project_dir,
            aurelia_dir,
            config: Arc::new(config),
            journal,
            ids,
            worktrees,
            sandbox,
            llm,
            shutdown: Shutdown::new(),
            handle_signals,
        })
    }

    /// The shutdown handle, for driving the engine from tests.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// A snapshot of the projected state.
    pub fn snapshot(&self) -> crate::state::RuntimeSnapshot {
        self.journal.snapshot()
    }

    /// Run the heartbeat loop to completion.
    pub async fn start(&self) -> Result<StopReason, EngineError> {
        GitRepo::new(&self.project_dir).check().await?;

        // Candidates are never resumed: everything under the worktree base is
        // an orphan from a previous run.
        let pruned = self.worktrees.prune_orphans().await?;
        if pruned > 0 {
            info!(pruned, "cleaned up orphaned worktrees");
        }

        self.acquire_pid_file()?;
        if self.handle_signals {
            install_handlers(self.shutdown.clone())?;
        }

        self.journal
            .record(Event::runtime_started(std::process::id()))?;
        info!(pid = std::process::id(), project = %self.project_dir.display(), "runtime started");

        let engine = Arc::new(CandidateEngine::new(
            self.journal.clone(),
            self.worktrees.clone(),
            self.sandbox.clone(),
            self.llm.clone(),
            self.config.clone(),
            self.shutdown.clone(),
            self.project_dir.clone(),
            self.aurelia_dir.join("logs"),
        ));
        let scheduler = HeartbeatScheduler::new(
            self.config.clone(),
            self.journal.clone(),
            engine,
            self.sandbox.clone(),
            self.ids.clone(),
            self.shutdown.clone(),
        )?;

        let result = scheduler.run().await;
        self.release_pid_file();
        result
    }

    /// Write `.aurelia/pid`, refusing to start while another live process
    /// holds it. Stale files are removed with a warning.
    fn acquire_pid_file(&self) -> Result<(), EngineError> {
        let path = self.pid_path();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                if process_alive(pid) {
                    return Err(EngineError::AlreadyRunning(pid));
                }
                warn!(pid, "removing stale pid file");
            }
            let _ = std::fs::remove_file(&path);
        }
        std::fs::create_dir_all(&self.aurelia_dir)?;
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(())
    }

    fn release_pid_file(&self) {
        let _ = std::fs::remove_file(self.pid_path());
    }

    fn pid_path(&self) -> PathBuf {
        self.aurelia_dir.join("pid")
    }
}

/// Whether a process with `pid` exists (signal 0 probe).
pub fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Create the `.aurelia/` skeleton for a project.
///
/// Fails if the directory already exists.
pub fn init_project(project_dir: &Path) -> Result<(), std::io::Error> {
    let aurelia_dir = project_dir.join(".aurelia");
    if aurelia_dir.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "already initialized",
        ));
    }
    for sub in ["config", "state", "worktrees", "logs"] {
        std::fs::create_dir_all(aurelia_dir.join(sub))?;
    }
    std::fs::write(
        aurelia_dir.join("config").join("workflow.yaml"),
        "# Aurelia workflow configuration.\n\
         #\n\
         # runtime:\n\
         #   heartbeat_interval_s: 60\n\
         #   max_concurrent_tasks: 4\n\
         #   candidate_abandon_threshold: 3\n\
         #   termination_condition: \"accuracy>=0.95\"\n\
         #   sandbox:\n\
         #     image: aurelia-sandbox:latest\n\
         #     env_forward: [GEMINI_API_KEY]\n",
    )?;
    Ok(())
}
