//! End-to-end engine scenarios: mock LLM, local sandbox, real git repos.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use aurelia::config::{EvaluatorSettings, PresubmitSettings, RuntimeConfig};
use aurelia::engine::{init_project, Runtime, StopReason};
use aurelia::events::EventLog;
use aurelia::llm::{ChatRequest, ChatResponse, LlmClient, LlmError, MockLlmClient};
use aurelia::sandbox::LocalSandbox;
use aurelia::state::{CandidateState, StateStore};

/// Run a git command in `dir`, panicking on failure.
fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// A project directory with one commit and an initialized `.aurelia/`.
fn project() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    git(&root, &["init", "-b", "main"]);
    git(&root, &["config", "user.email", "test@example.com"]);
    git(&root, &["config", "user.name", "test"]);
    std::fs::write(root.join("README.md"), "# demo project: maximise accuracy\n")
        .expect("write readme");
    std::fs::write(root.join("evaluate.py"), "print('{\"accuracy\": 0.0}')\n")
        .expect("write eval script");
    git(&root, &["add", "."]);
    git(&root, &["commit", "-m", "initial"]);
    init_project(&root).expect("init");
    (dir, root)
}

fn config(termination: &str, max_concurrent: usize, abandon: usize) -> RuntimeConfig {
    RuntimeConfig {
        heartbeat_interval_s: 0.01,
        max_concurrent_tasks: max_concurrent,
        candidate_abandon_threshold: abandon,
        termination_condition: termination.to_string(),
        presubmit: PresubmitSettings {
            command: "true".to_string(),
            timeout_s: 30,
        },
        evaluator: EvaluatorSettings {
            command: "cat metrics.json".to_string(),
            timeout_s: 30,
            script: "evaluate.py".to_string(),
        },
        ..Default::default()
    }
}

/// A mock response pair that writes a metrics file and finishes.
fn solve_with(metrics_json: &str) -> Vec<ChatResponse> {
    vec![
        ChatResponse::tool_call(
            "write_file",
            json!({ "path": "metrics.json", "content": metrics_json }),
        )
        .with_usage(100, 20),
        ChatResponse::final_text("metrics written").with_usage(110, 10),
    ]
}

fn scan_kinds(root: &Path) -> Vec<String> {
    let log = EventLog::open(root.join(".aurelia/events.jsonl")).expect("open log");
    log.scan()
        .expect("scan")
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn happy_single_cycle_terminates_on_metric() {
    let (_dir, root) = project();
    let llm = Arc::new(MockLlmClient::scripted(solve_with(r#"{"accuracy": 1.0}"#)));
    let runtime = Runtime::with_collaborators(
        &root,
        config("accuracy>=0.5", 1, 10),
        Arc::new(LocalSandbox::new()),
        llm,
        false,
    )
    .expect("build");

    let reason = runtime.start().await.expect("start");
    assert_eq!(reason, StopReason::TerminationConditionMet);

    let snapshot = runtime.snapshot();
    assert_eq!(snapshot.candidates.len(), 1);
    let candidate = &snapshot.candidates[&1];
    assert_eq!(candidate.state, CandidateState::Succeeded);
    assert_eq!(candidate.metrics.as_ref().expect("metrics")["accuracy"], 1.0);
    assert!(candidate.finished_at.expect("finished") >= candidate.created_at);

    // Strict per-candidate event ordering, then the runtime stop pair.
    let kinds = scan_kinds(&root);
    let expected_prefix = [
        "runtime_started",
        "candidate_created",
        "candidate_stage_started", // coding
    ];
    for (i, kind) in expected_prefix.iter().enumerate() {
        assert_eq!(&kinds[i], kind, "event {i}");
    }
    assert!(kinds.contains(&"candidate_evaluated".to_string()));
    assert_eq!(kinds[kinds.len() - 2], "runtime_stopping");
    assert_eq!(kinds[kinds.len() - 1], "runtime_stopped");

    // Stage ordering for candidate 1 is coding → presubmit → evaluating.
    let log = EventLog::open(root.join(".aurelia/events.jsonl")).expect("open");
    let stages: Vec<String> = log
        .scan()
        .expect("scan")
        .into_iter()
        .filter(|e| e.kind == "candidate_stage_started")
        .map(|e| e.payload["stage"].as_str().expect("stage").to_string())
        .collect();
    assert_eq!(stages, vec!["coding", "presubmit", "evaluating"]);

    // Worktree cleaned up, branch kept for future parents.
    assert!(!root.join(".aurelia/worktrees/1").exists());

    // Replaying the on-disk log reproduces the live projection exactly.
    let events = log.scan().expect("scan");
    let replayed = StateStore::replay(Some("accuracy".to_string()), &events).snapshot();
    assert_eq!(replayed, snapshot);
}

#[tokio::test]
async fn abandon_after_repeated_presubmit_failures() {
    let (_dir, root) = project();
    let mut cfg = config("accuracy>=0.5", 1, 2);
    cfg.presubmit.command = "exit 1".to_string();
    // Script is empty: the coder immediately finishes without edits, and
    // presubmit fails every attempt.
    let llm = Arc::new(MockLlmClient::scripted(Vec::new()));
    let runtime = Runtime::with_collaborators(
        &root,
        cfg,
        Arc::new(LocalSandbox::new()),
        llm,
        false,
    )
    .expect("build");

    let reason = runtime.start().await.expect("start");
    assert_eq!(reason, StopReason::AbandonThresholdReached);

    let snapshot = runtime.snapshot();
    assert_eq!(snapshot.candidates.len(), 2, "no third candidate");
    for candidate in snapshot.candidates.values() {
        assert_eq!(candidate.state, CandidateState::Failed);
        assert_eq!(
            candidate.error.as_ref().expect("error").kind,
            "presubmit_fail"
        );
    }

    let kinds = scan_kinds(&root);
    let failures = kinds.iter().filter(|k| *k == "candidate_failed").count();
    assert_eq!(failures, 2);
    assert!(kinds.contains(&"runtime_stopping".to_string()));
}

#[tokio::test]
async fn parent_reuse_follows_best_so_far() {
    let (_dir, root) = project();
    let mut script = solve_with(r#"{"score": 0.3}"#);
    script.extend(solve_with(r#"{"score": 0.7}"#));
    script.extend(solve_with(r#"{"score": 0.8}"#));
    let llm = Arc::new(MockLlmClient::scripted(script));

    let runtime = Runtime::with_collaborators(
        &root,
        config("score>=0.75", 1, 10),
        Arc::new(LocalSandbox::new()),
        llm,
        false,
    )
    .expect("build");

    let reason = runtime.start().await.expect("start");
    assert_eq!(reason, StopReason::TerminationConditionMet);

    let snapshot = runtime.snapshot();
    assert_eq!(snapshot.candidates.len(), 3);
    assert_eq!(snapshot.candidates[&1].parent_id, None);
    assert_eq!(snapshot.candidates[&2].parent_id, Some(1));
    assert_eq!(snapshot.candidates[&3].parent_id, Some(2));
    assert_eq!(snapshot.best, Some(3));

    // Every parent was succeeded at the moment its child was created.
    for candidate in snapshot.candidates.values() {
        if let Some(parent_id) = candidate.parent_id {
            assert_eq!(
                snapshot.candidates[&parent_id].state,
                CandidateState::Succeeded
            );
        }
    }

    // Candidate 3's branch descends from candidate 2's branch.
    let status = std::process::Command::new("git")
        .args(["merge-base", "--is-ancestor", "aurelia/2", "aurelia/3"])
        .current_dir(&root)
        .status()
        .expect("spawn git");
    assert!(status.success(), "aurelia/3 does not descend from aurelia/2");
}

/// LLM that responds slowly with endless tool calls, so shutdown lands
/// mid-coding.
struct SlowToolLoopLlm;

#[async_trait::async_trait]
impl LlmClient for SlowToolLoopLlm {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ChatResponse::tool_call("read_file", json!({ "path": "README.md" })))
    }
}

#[tokio::test]
async fn graceful_shutdown_mid_coding_aborts_candidate() {
    let (_dir, root) = project();
    let runtime = Runtime::with_collaborators(
        &root,
        config("accuracy>=0.5", 1, 100),
        Arc::new(LocalSandbox::new()),
        Arc::new(SlowToolLoopLlm),
        false,
    )
    .expect("build");

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger();
    });

    let reason = tokio::time::timeout(Duration::from_secs(30), runtime.start())
        .await
        .expect("drain finished")
        .expect("start");
    assert_eq!(reason, StopReason::ShutdownRequested);

    let snapshot = runtime.snapshot();
    assert!(snapshot.stopped);
    assert_eq!(snapshot.candidates[&1].state, CandidateState::Aborted);

    let kinds = scan_kinds(&root);
    assert!(kinds.contains(&"candidate_aborted".to_string()));
    assert!(!kinds.contains(&"candidate_evaluated".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("runtime_stopped"));
}

#[tokio::test]
async fn torn_log_recovers_in_status_projection() {
    let (_dir, root) = project();
    let llm = Arc::new(MockLlmClient::scripted(solve_with(r#"{"accuracy": 1.0}"#)));
    let runtime = Runtime::with_collaborators(
        &root,
        config("accuracy>=0.5", 1, 10),
        Arc::new(LocalSandbox::new()),
        llm,
        false,
    )
    .expect("build");
    runtime.start().await.expect("start");

    // Damage the tail of the log, as an interrupted write would.
    let log_path = root.join(".aurelia/events.jsonl");
    let raw = std::fs::read(&log_path).expect("read");
    std::fs::write(&log_path, &raw[..raw.len() - 10]).expect("truncate");

    let log = EventLog::open(&log_path).expect("open");
    let events = log.scan().expect("scan");
    assert!(!events.is_empty());
    // The torn trailing record was runtime_stopped; everything earlier
    // survives and projects cleanly.
    let snapshot = StateStore::replay(Some("accuracy".to_string()), &events).snapshot();
    assert_eq!(snapshot.candidates[&1].state, CandidateState::Succeeded);
    assert!(snapshot.shutting_down);
    assert!(!snapshot.stopped);
}

#[tokio::test]
async fn tool_path_escape_is_contained() {
    let (_dir, root) = project();
    let mut script = vec![ChatResponse::tool_call(
        "read_file",
        json!({ "path": "../../etc/passwd" }),
    )];
    script.extend(solve_with(r#"{"accuracy": 0.9}"#));
    let llm = Arc::new(MockLlmClient::scripted(script));

    let runtime = Runtime::with_collaborators(
        &root,
        config("accuracy>=0.5", 1, 10),
        Arc::new(LocalSandbox::new()),
        llm,
        false,
    )
    .expect("build");

    let reason = runtime.start().await.expect("start");
    // The escape was reported to the model as a tool error; the candidate
    // still completed.
    assert_eq!(reason, StopReason::TerminationConditionMet);
    assert_eq!(
        runtime.snapshot().candidates[&1].state,
        CandidateState::Succeeded
    );
}

#[tokio::test]
async fn restart_never_reuses_candidate_ids() {
    let (_dir, root) = project();
    let mut cfg = config("accuracy>=0.5", 1, 1);
    cfg.presubmit.command = "exit 1".to_string();

    let runtime = Runtime::with_collaborators(
        &root,
        cfg.clone(),
        Arc::new(LocalSandbox::new()),
        Arc::new(MockLlmClient::scripted(Vec::new())),
        false,
    )
    .expect("build");
    runtime.start().await.expect("first run");
    assert_eq!(runtime.snapshot().candidates.len(), 1);
    drop(runtime);

    let runtime = Runtime::with_collaborators(
        &root,
        cfg,
        Arc::new(LocalSandbox::new()),
        Arc::new(MockLlmClient::scripted(Vec::new())),
        false,
    )
    .expect("rebuild");
    runtime.start().await.expect("second run");

    let snapshot = runtime.snapshot();
    assert!(snapshot.candidates.contains_key(&1));
    assert!(snapshot.candidates.contains_key(&2));
}
