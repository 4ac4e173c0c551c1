//! Coder stage: a bounded LLM tool-use conversation.
//!
//! The conversation is seeded with the problem statement, the evaluation
//! script text, a summary of prior candidate outcomes, and the tool schema.
//! Each turn either requests tool calls (executed through the worktree-scoped
//! tool server) or ends the stage with a final message. The loop stops on:
//! a final message, an exhausted turn budget (`coder_turn_budget`), a fatal
//! tool failure (`coder_tool_error`), or an observed shutdown (aborted).

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::CoderSettings;
use crate::events::Event;
use crate::journal::Journal;
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::signals::Shutdown;
use crate::stages::{FailureKind, StageCapture, StageOutcome};
use crate::tools::ToolServer;

/// Inputs assembled by the candidate engine for one coder run.
pub struct CoderContext<'a> {
    pub candidate_id: u64,
    pub tools: &'a ToolServer,
    pub journal: Arc<Journal>,
    /// Problem statement (the project README).
    pub problem_statement: String,
    /// Text of the evaluation script, shown so the coder knows the target.
    pub eval_script: String,
    /// Per-attempt summary of prior candidates (ids, metrics, error kinds).
    pub prior_outcomes: String,
}

/// Drives the LLM + tools until the solution is edited or budget runs out.
pub struct CoderStage {
    llm: Arc<dyn LlmClient>,
    settings: CoderSettings,
    shutdown: Shutdown,
}

impl CoderStage {
    pub fn new(llm: Arc<dyn LlmClient>, settings: CoderSettings, shutdown: Shutdown) -> Self {
        Self {
            llm,
            settings,
            shutdown,
        }
    }

    pub async fn run(&self, ctx: CoderContext<'_>) -> (StageOutcome, StageCapture) {
        let mut transcript = String::new();
        let mut messages = vec![
            ChatMessage::system(build_system_prompt(
                &ctx.problem_statement,
                &ctx.eval_script,
                &ctx.prior_outcomes,
            )),
            ChatMessage::user(
                "Improve the project in the current worktree so the evaluation \
                 score improves. Reply without a tool call when you are done.",
            ),
        ];

        for turn in 0..self.settings.turn_budget {
            if self.shutdown.is_triggered() {
                return (StageOutcome::Aborted, capture(transcript));
            }

            let request = ChatRequest::new(
                self.settings.model.clone(),
                messages.clone(),
                ToolServer::schema(),
            );
            let response = match self.llm.chat(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(candidate_id = ctx.candidate_id, error = %e, "llm call failed");
                    return (
                        StageOutcome::failed(FailureKind::CoderToolError, format!("llm: {e}")),
                        capture(transcript),
                    );
                }
            };

            if ctx
                .journal
                .record(Event::llm_call(
                    ctx.candidate_id,
                    response.tokens_in,
                    response.tokens_out,
                    response.cached,
                ))
                .is_err()
            {
                return (
                    StageOutcome::failed(FailureKind::CoderToolError, "event log write failed"),
                    capture(transcript),
                );
            }

            if let Some(text) = &response.text {
                transcript.push_str(&format!("[turn {turn}] assistant: {text}\n"));
            }

            if response.is_final() {
                info!(candidate_id = ctx.candidate_id, turns = turn + 1, "coder finished");
                return (StageOutcome::Ok, capture(transcript));
            }

            messages.push(ChatMessage::assistant(
                serde_json::to_string(&response.tool_calls).unwrap_or_default(),
            ));

            for call in &response.tool_calls {
                if self.shutdown.is_triggered() {
                    return (StageOutcome::Aborted, capture(transcript));
                }
                transcript.push_str(&format!("[turn {turn}] tool: {}\n", call.name));

                match ctx.tools.invoke(&call.name, &call.arguments).await {
                    Ok(output) => messages.push(ChatMessage::tool(output)),
                    Err(e) if e.is_fatal() => {
                        warn!(
                            candidate_id = ctx.candidate_id,
                            tool = %call.name,
                            error = %e,
                            "fatal tool failure"
                        );
                        return (
                            StageOutcome::failed(
                                FailureKind::CoderToolError,
                                format!("{}: {e}", call.name),
                            ),
                            capture(transcript),
                        );
                    }
                    Err(e) => {
                        // Reported back to the model (path escapes, bad
                        // arguments); the conversation continues.
                        transcript.push_str(&format!("[turn {turn}] tool error: {e}\n"));
                        messages.push(ChatMessage::tool(format!("tool error: {e}")));
                    }
                }
            }
        }

        (
            StageOutcome::failed(
                FailureKind::CoderTurnBudget,
                format!("turn budget of {} exhausted", self.settings.turn_budget),
            ),
            capture(transcript),
        )
    }
}

fn capture(transcript: String) -> StageCapture {
    StageCapture {
        stdout: transcript,
        stderr: String::new(),
    }
}

fn build_system_prompt(problem: &str, eval_script: &str, prior: &str) -> String {
    let prior = if prior.trim().is_empty() {
        "This is the first attempt."
    } else {
        prior
    };
    format!(
        "You are the coder in an autonomous improvement loop. You work inside \
         an isolated checkout of the project. Modify files and run commands \
         through the provided tools only.\n\n\
         ## Problem\n{problem}\n\n\
         ## Evaluation script\n```\n{eval_script}\n```\n\n\
         ## Previous attempts\n{prior}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoderSettings;
    use crate::events::EventLog;
    use crate::llm::{ChatResponse, MockLlmClient};
    use crate::sandbox::LocalSandbox;
    use crate::state::StateStore;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        journal: Arc<Journal>,
        tools_worktree: std::path::PathBuf,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(dir.path().join("events.jsonl")).expect("open");
        let journal = Journal::new(log, StateStore::new(None));
        let worktree = dir.path().join("wt");
        std::fs::create_dir_all(&worktree).expect("mkdir");
        Harness {
            _dir: dir,
            journal,
            tools_worktree: worktree,
        }
    }

    fn tools(h: &Harness) -> ToolServer {
        ToolServer::new(
            h.tools_worktree.clone(),
            Arc::new(LocalSandbox::new()),
            Vec::new(),
            Duration::from_secs(10),
            h.journal.clone(),
            1,
        )
    }

    fn context<'a>(h: &'a Harness, tools: &'a ToolServer) -> CoderContext<'a> {
        CoderContext {
            candidate_id: 1,
            tools,
            journal: h.journal.clone(),
            problem_statement: "maximise accuracy".to_string(),
            eval_script: "print accuracy".to_string(),
            prior_outcomes: String::new(),
        }
    }

    fn settings(turn_budget: u32) -> CoderSettings {
        CoderSettings {
            turn_budget,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_file_then_finishes() {
        let h = harness();
        let tools = tools(&h);
        let llm = Arc::new(MockLlmClient::scripted(vec![
            ChatResponse::tool_call(
                "write_file",
                json!({ "path": "solution.py", "content": "print('v2')\n" }),
            )
            .with_usage(100, 20),
            ChatResponse::final_text("solution written").with_usage(120, 10),
        ]));

        let stage = CoderStage::new(llm, settings(5), Shutdown::new());
        let (outcome, _) = stage.run(context(&h, &tools)).await;

        assert_eq!(outcome, StageOutcome::Ok);
        assert!(h.tools_worktree.join("solution.py").exists());

        let snap = h.journal.snapshot();
        assert_eq!(snap.usage.llm_calls, 2);
        assert_eq!(snap.usage.tokens_in, 220);
        assert_eq!(snap.usage.tools_invoked, 1);
    }

    #[tokio::test]
    async fn turn_budget_exhaustion_fails() {
        let h = harness();
        let tools = tools(&h);
        // Every turn asks for another tool call; the budget runs out.
        let llm = Arc::new(MockLlmClient::scripted(vec![
            ChatResponse::tool_call("read_file", json!({ "path": "a.txt" }));
            3
        ]));

        let stage = CoderStage::new(llm, settings(2), Shutdown::new());
        let (outcome, _) = stage.run(context(&h, &tools)).await;

        match outcome {
            StageOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::CoderTurnBudget),
            other => panic!("expected turn budget failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn path_escape_is_reported_and_conversation_continues() {
        let h = harness();
        let tools = tools(&h);
        let llm = Arc::new(MockLlmClient::scripted(vec![
            ChatResponse::tool_call("read_file", json!({ "path": "../../etc/passwd" })),
            ChatResponse::final_text("understood, staying inside the worktree"),
        ]));

        let stage = CoderStage::new(llm.clone(), settings(5), Shutdown::new());
        let (outcome, capture) = stage.run(context(&h, &tools)).await;

        assert_eq!(outcome, StageOutcome::Ok);
        assert!(capture.stdout.contains("tool error"));
        // Second request saw the tool error message.
        let messages = llm.request_messages(1).expect("second request");
        assert!(messages
            .iter()
            .any(|m| m.role == "tool" && m.content.contains("escapes the worktree")));
    }

    #[tokio::test]
    async fn shutdown_between_turns_aborts() {
        let h = harness();
        let tools = tools(&h);
        let llm = Arc::new(MockLlmClient::scripted(Vec::new()));
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let stage = CoderStage::new(llm.clone(), settings(5), shutdown);
        let (outcome, _) = stage.run(context(&h, &tools)).await;

        assert_eq!(outcome, StageOutcome::Aborted);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn prompt_carries_problem_and_prior_outcomes() {
        let h = harness();
        let tools = tools(&h);
        let llm = Arc::new(MockLlmClient::scripted(Vec::new()));
        let stage = CoderStage::new(llm.clone(), settings(5), Shutdown::new());

        let mut ctx = context(&h, &tools);
        ctx.prior_outcomes = "candidate 1: failed (presubmit_fail)".to_string();
        stage.run(ctx).await;

        let messages = llm.request_messages(0).expect("first request");
        let system = &messages[0];
        assert_eq!(system.role, "system");
        assert!(system.content.contains("maximise accuracy"));
        assert!(system.content.contains("presubmit_fail"));
    }
}
