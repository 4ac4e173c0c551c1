//! Worktree-scoped tool server for the coder.
//!
//! Exposes exactly three capabilities — `read_file`, `write_file`,
//! `run_command` — each confined to a single candidate's worktree. Paths are
//! normalised lexically and rejected with [`ToolError::PathEscape`] before
//! any filesystem access, so an escaping call leaves the filesystem
//! unchanged. Every invocation is recorded as a `tool_invoked` event with a
//! size/argv summary, never raw payloads.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::error::SandboxError;
use crate::events::Event;
use crate::journal::Journal;
use crate::sandbox::{Sandbox, SandboxRequest};

/// Errors surfaced by tool invocations.
///
/// Non-fatal variants are reported back to the model as tool errors so the
/// conversation can continue; fatal ones abort the coder stage.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("path escapes the worktree: {0}")]
    PathEscape(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl ToolError {
    /// Fatal errors terminate the coder stage (`coder_tool_error`);
    /// everything else is returned to the model.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Io(_) | ToolError::Sandbox(_))
    }
}

/// Tool capabilities scoped to one candidate's worktree.
pub struct ToolServer {
    worktree: PathBuf,
    sandbox: Arc<dyn Sandbox>,
    env: Vec<(String, String)>,
    command_timeout: Duration,
    journal: Arc<Journal>,
    candidate_id: u64,
}

impl ToolServer {
    pub fn new(
        worktree: impl Into<PathBuf>,
        sandbox: Arc<dyn Sandbox>,
        env: Vec<(String, String)>,
        command_timeout: Duration,
        journal: Arc<Journal>,
        candidate_id: u64,
    ) -> Self {
        Self {
            worktree: worktree.into(),
            sandbox,
            env,
            command_timeout,
            journal,
            candidate_id,
        }
    }

    /// Read a file relative to the worktree.
    pub fn read_file(&self, relpath: &str) -> Result<Vec<u8>, ToolError> {
        let path = self.resolve(relpath)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound(relpath.to_string()))
            }
            Err(e) => return Err(ToolError::Io(e)),
        };
        debug!(candidate_id = self.candidate_id, path = relpath, bytes = bytes.len(), "read_file");
        Ok(bytes)
    }

    /// Write a file relative to the worktree, creating parent directories
    /// and replacing atomically (temp file + rename).
    pub fn write_file(&self, relpath: &str, bytes: &[u8]) -> Result<(), ToolError> {
        let path = self.resolve(relpath)?;
        let parent = path.parent().unwrap_or(&self.worktree);
        std::fs::create_dir_all(parent)?;

        let tmp = parent.join(format!(
            ".aurelia-write-{}-{}",
            std::process::id(),
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(candidate_id = self.candidate_id, path = relpath, bytes = bytes.len(), "write_file");
        Ok(())
    }

    /// Run a command in the worktree via the sandbox.
    pub async fn run_command(&self, argv: Vec<String>) -> Result<(i64, String, String), ToolError> {
        if argv.is_empty() {
            return Err(ToolError::InvalidParameters("empty argv".to_string()));
        }
        let request = SandboxRequest {
            argv,
            worktree: self.worktree.clone(),
            env: self.env.clone(),
            timeout: self.command_timeout,
        };
        let result = self.sandbox.run(request).await?;
        Ok((result.exit_code, result.stdout, result.stderr))
    }

    /// Dispatch a named tool with JSON arguments, recording a `tool_invoked`
    /// event. The returned string is what the model sees; non-fatal errors
    /// become `Err` values the caller can render as tool errors.
    pub async fn invoke(&self, name: &str, args: &Value) -> Result<String, ToolError> {
        let (summary, outcome) = match name {
            "read_file" => {
                let relpath = str_arg(args, "path")?;
                let outcome = self.read_file(relpath).map(|bytes| {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    (format!("{relpath} ({} bytes)", bytes.len()), text)
                });
                match outcome {
                    Ok((summary, text)) => (summary, Ok(text)),
                    Err(e) => (relpath.to_string(), Err(e)),
                }
            }
            "write_file" => {
                let relpath = str_arg(args, "path")?;
                let content = str_arg(args, "content")?;
                match self.write_file(relpath, content.as_bytes()) {
                    Ok(()) => (
                        format!("{relpath} ({} bytes)", content.len()),
                        Ok(format!("wrote {} bytes to {relpath}", content.len())),
                    ),
                    Err(e) => (relpath.to_string(), Err(e)),
                }
            }
            "run_command" => {
                let argv: Vec<String> = args
                    .get("argv")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect()
                    })
                    .ok_or_else(|| {
                        ToolError::InvalidParameters("'argv' must be an array of strings".into())
                    })?;
                let summary = truncate(&argv.join(" "), 120);
                match self.run_command(argv).await {
                    Ok((exit, stdout, stderr)) => (
                        summary,
                        Ok(format!("exit={exit}\nstdout:\n{stdout}\nstderr:\n{stderr}")),
                    ),
                    Err(e) => (summary, Err(e)),
                }
            }
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };

        self.journal
            .record(Event::tool_invoked(self.candidate_id, name, &summary))
            .ok();
        outcome
    }

    /// JSON schema of the three tools, for the LLM request.
    pub fn schema() -> Value {
        json!([
            {
                "name": "read_file",
                "description": "Read a file from the worktree.",
                "parameters": {
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }
            },
            {
                "name": "write_file",
                "description": "Write a file in the worktree, creating parent directories.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }
            },
            {
                "name": "run_command",
                "description": "Run a command in the worktree sandbox.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "argv": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["argv"]
                }
            }
        ])
    }

    /// Normalise `relpath` lexically and anchor it inside the worktree.
    fn resolve(&self, relpath: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(relpath);
        if candidate.is_absolute() {
            return Err(ToolError::PathEscape(relpath.to_string()));
        }

        let mut stack: Vec<std::ffi::OsString> = Vec::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => stack.push(part.to_os_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if stack.pop().is_none() {
                        return Err(ToolError::PathEscape(relpath.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolError::PathEscape(relpath.to_string()))
                }
            }
        }

        let mut resolved = self.worktree.clone();
        for part in stack {
            resolved.push(part);
        }
        Ok(resolved)
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("'{key}' must be a string")))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::sandbox::LocalSandbox;
    use crate::state::StateStore;

    fn server(dir: &tempfile::TempDir) -> ToolServer {
        let log = EventLog::open(dir.path().join("events.jsonl")).expect("open");
        let journal = Journal::new(log, StateStore::new(None));
        let worktree = dir.path().join("wt");
        std::fs::create_dir_all(&worktree).expect("mkdir");
        ToolServer::new(
            worktree,
            Arc::new(LocalSandbox::new()),
            Vec::new(),
            Duration::from_secs(10),
            journal,
            1,
        )
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);

        tools
            .write_file("nested/dir/solution.py", b"print(1)\n")
            .expect("write");
        let bytes = tools.read_file("nested/dir/solution.py").expect("read");
        assert_eq!(bytes, b"print(1)\n");
    }

    #[test]
    fn parent_traversal_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);
        std::fs::write(dir.path().join("secret.txt"), "secret").expect("write");

        let err = tools.read_file("../secret.txt").unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
        assert!(!err.is_fatal());

        let err = tools.write_file("../../etc/evil", b"x").unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
        assert!(dir.path().join("secret.txt").exists());
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);
        let err = tools.read_file("/etc/passwd").unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
    }

    #[test]
    fn dotted_paths_that_stay_inside_are_allowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);
        tools.write_file("a/b.txt", b"ok").expect("write");
        let bytes = tools.read_file("a/./../a/b.txt").expect("read");
        assert_eq!(bytes, b"ok");
    }

    #[tokio::test]
    async fn invoke_records_tool_events_with_summaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);

        tools
            .invoke(
                "write_file",
                &json!({ "path": "f.txt", "content": "hello" }),
            )
            .await
            .expect("invoke");
        let result = tools
            .invoke("read_file", &json!({ "path": "f.txt" }))
            .await
            .expect("invoke");
        assert_eq!(result, "hello");

        let snap = tools.journal.snapshot();
        assert_eq!(snap.usage.tools_invoked, 2);
    }

    #[tokio::test]
    async fn invoke_run_command_executes_in_worktree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);
        tools.write_file("data.txt", b"payload").expect("write");

        let result = tools
            .invoke("run_command", &json!({ "argv": ["cat", "data.txt"] }))
            .await
            .expect("invoke");
        assert!(result.contains("exit=0"));
        assert!(result.contains("payload"));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_fatal_dispatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = server(&dir);
        let err = tools.invoke("format_disk", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
        assert!(!err.is_fatal());
    }
}
