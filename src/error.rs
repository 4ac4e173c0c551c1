//! Error types for aurelia subsystems.
//!
//! Each subsystem gets its own error enum:
//! - Configuration loading and validation
//! - Event log persistence
//! - Git repository and worktree operations
//! - Sandbox (container/subprocess) execution
//!
//! Candidate-scoped failures (presubmit fail, eval error, coder turn budget)
//! are not errors: they are stage outcomes, defined in `crate::stages`.

use thiserror::Error;

/// Errors raised while loading or validating runtime configuration.
///
/// All of these are fatal at startup, before any event is written.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file '{path}' could not be read: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("Config file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid termination condition '{expr}': {reason}")]
    InvalidTermination { expr: String, reason: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors raised by the append-only event log.
///
/// A write failure is fatal for the engine: it cannot continue without a
/// durable record.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Failed to write event log: {0}")]
    Write(std::io::Error),

    #[error("Failed to read event log: {0}")]
    Read(std::io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Event log is closed (runtime_stopped already written)")]
    Closed,
}

/// Errors raised by git repository and worktree operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} failed (exit {code}): {stderr}")]
    CommandFailed {
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to spawn git: {0}")]
    Spawn(std::io::Error),

    #[error("'{0}' is not a git repository")]
    NotARepository(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to launch sandboxed command: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
