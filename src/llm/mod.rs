//! Abstract LLM capability.
//!
//! The engine only depends on the [`LlmClient`] trait: one `chat` call over
//! a tool-using protocol, returning either final text or a batch of tool
//! calls. Real transports are supplied externally; this crate ships the
//! scripted mock used by `--mock` runs and tests, plus a response-caching
//! wrapper in [`cache`].

pub mod cache;

pub use cache::{CachedLlmClient, ResponseCache};

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from an LLM transport.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user", "assistant", or "tool".
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    /// A tool result fed back into the conversation.
    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
        }
    }
}

/// One tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// A chat request: model, conversation so far, and the tool schema.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Value,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, tools: Value) -> Self {
        Self {
            model: model.into(),
            messages,
            tools,
        }
    }
}

/// A chat response: final text, or a batch of tool calls to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant text, present on final responses.
    pub text: Option<String>,
    /// Requested tool calls; empty means the response is final.
    pub tool_calls: Vec<ToolCall>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Set by the caching wrapper when served from cache.
    #[serde(default)]
    pub cached: bool,
}

impl ChatResponse {
    /// A final text response with no tool calls.
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            cached: false,
        }
    }

    /// A response consisting of a single tool call.
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            text: None,
            tool_calls: vec![ToolCall {
                name: name.into(),
                arguments,
            }],
            tokens_in: 0,
            tokens_out: 0,
            cached: false,
        }
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// Whether the conversation is done (no tool calls requested).
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Request→response capability over a tool-using chat protocol.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Scripted client for tests and `--mock` runs.
///
/// Replays the configured responses in order and records every request for
/// assertions. Once the script is exhausted it keeps returning a final
/// "done" message so loops terminate.
pub struct MockLlmClient {
    responses: Mutex<VecDeque<ChatResponse>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl MockLlmClient {
    pub fn scripted(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of chat calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock poisoned").len()
    }

    /// Messages of the nth request, for prompt assertions.
    pub fn request_messages(&self, n: usize) -> Option<Vec<ChatMessage>> {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .get(n)
            .map(|r| r.messages.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.lock().expect("calls lock poisoned").push(request);
        let next = self
            .responses
            .lock()
            .expect("responses lock poisoned")
            .pop_front();
        Ok(next.unwrap_or_else(|| ChatResponse::final_text("done")))
    }
}
