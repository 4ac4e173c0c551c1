//! Heartbeat scheduler: the ticking supervisor.
//!
//! Each tick checks the drain conditions (shutdown requested, termination
//! condition met, abandon threshold hit), verifies the sandbox, then tops up
//! active candidates to the concurrency limit, forking from the best
//! candidate so far. Between ticks it sleeps for the heartbeat interval or
//! until a candidate finishes or a signal arrives. The scheduler observes
//! candidates only through state snapshots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{RuntimeConfig, TerminationCondition};
use crate::engine::candidate::CandidateEngine;
use crate::engine::EngineError;
use crate::events::Event;
use crate::ids::IdGenerator;
use crate::journal::Journal;
use crate::sandbox::Sandbox;
use crate::signals::Shutdown;

/// Ticks with the sandbox unreachable before the engine gives up.
const SANDBOX_FATAL_TICKS: u32 = 3;

/// Why the heartbeat loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ShutdownRequested,
    TerminationConditionMet,
    AbandonThresholdReached,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::ShutdownRequested => "shutdown_requested",
            StopReason::TerminationConditionMet => "termination_condition_met",
            StopReason::AbandonThresholdReached => "abandon_threshold_reached",
        }
    }
}

/// The ticking supervisor that owns candidate lifecycles.
pub struct HeartbeatScheduler {
    config: Arc<RuntimeConfig>,
    journal: Arc<Journal>,
    engine: Arc<CandidateEngine>,
    sandbox: Arc<dyn Sandbox>,
    ids: Arc<IdGenerator>,
    shutdown: Shutdown,
    termination: Option<TerminationCondition>,
    wakeup: Arc<Notify>,
}

impl HeartbeatScheduler {
    pub fn new(
        config: Arc<RuntimeConfig>,
        journal: Arc<Journal>,
        engine: Arc<CandidateEngine>,
        sandbox: Arc<dyn Sandbox>,
        ids: Arc<IdGenerator>,
        shutdown: Shutdown,
    ) -> Result<Self, EngineError> {
        let termination = config.termination()?;
        Ok(Self {
            config,
            journal,
            engine,
            sandbox,
            ids,
            shutdown,
            termination,
            wakeup: Arc::new(Notify::new()),
        })
    }

    /// Run ticks until a drain condition fires, then drain and stop.
    pub async fn run(&self) -> Result<StopReason, EngineError> {
        let mut tasks: JoinSet<Result<(), crate::error::EventLogError>> = JoinSet::new();
        let mut sandbox_down_ticks: u32 = 0;
        let interval = Duration::from_secs_f64(self.config.heartbeat_interval_s);

        let reason = loop {
            self.reap_finished(&mut tasks)?;
            let snapshot = self.journal.snapshot();

            if self.shutdown.is_triggered() {
                break StopReason::ShutdownRequested;
            }
            if let Some(cond) = &self.termination {
                if snapshot.termination_met(cond) {
                    info!(condition = %self.config.termination_condition, "termination condition met");
                    break StopReason::TerminationConditionMet;
                }
            }
            if snapshot.consecutive_failures >= self.config.candidate_abandon_threshold {
                warn!(
                    failures = snapshot.consecutive_failures,
                    threshold = self.config.candidate_abandon_threshold,
                    "abandoning after repeated failure"
                );
                break StopReason::AbandonThresholdReached;
            }

            match self.sandbox.check().await {
                Ok(()) => sandbox_down_ticks = 0,
                Err(e) => {
                    sandbox_down_ticks += 1;
                    warn!(error = %e, ticks = sandbox_down_ticks, "sandbox unavailable");
                    if sandbox_down_ticks >= SANDBOX_FATAL_TICKS {
                        self.shutdown.trigger();
                        self.drain(&mut tasks, "sandbox_unavailable").await?;
                        return Err(EngineError::SandboxUnavailable(e.to_string()));
                    }
                }
            }

            if sandbox_down_ticks == 0 {
                // One spawned task covers exactly one candidate from creation
                // to its terminal event, so bounding the task set bounds the
                // active candidates.
                while tasks.len() < self.config.max_concurrent_tasks
                    && !self.shutdown.is_triggered()
                {
                    let id = self.ids.next_id();
                    let parent = snapshot
                        .best_candidate()
                        .map(|c| (c.id, c.branch.clone()));
                    info!(candidate_id = id, parent = ?parent.as_ref().map(|(pid, _)| pid), "spawning candidate");

                    let engine = self.engine.clone();
                    let wakeup = self.wakeup.clone();
                    tasks.spawn(async move {
                        let result = engine.run(id, parent).await;
                        wakeup.notify_one();
                        result
                    });
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wakeup.notified() => {}
                _ = self.shutdown.wait() => {}
            }
        };

        self.drain(&mut tasks, reason.as_str()).await?;
        Ok(reason)
    }

    /// Stop creating candidates, wait for the active ones, stop the runtime.
    async fn drain(
        &self,
        tasks: &mut JoinSet<Result<(), crate::error::EventLogError>>,
        reason: &str,
    ) -> Result<(), EngineError> {
        info!(reason, active = tasks.len(), "draining");
        self.journal.record(Event::runtime_stopping(reason))?;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // A candidate task could not write the log; nothing more
                    // can be durably recorded, so give up on the rest.
                    error!(error = %e, "candidate task lost event-log access");
                    return Err(EngineError::EventLog(e));
                }
                Err(e) => error!(error = %e, "candidate task panicked"),
            }
        }

        self.sandbox.kill_all().await;
        self.journal.record(Event::runtime_stopped())?;
        info!("runtime stopped");
        Ok(())
    }

    fn reap_finished(
        &self,
        tasks: &mut JoinSet<Result<(), crate::error::EventLogError>>,
    ) -> Result<(), EngineError> {
        while let Some(joined) = tasks.try_join_next() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(EngineError::EventLog(e)),
                Err(e) => error!(error = %e, "candidate task panicked"),
            }
        }
        Ok(())
    }
}
