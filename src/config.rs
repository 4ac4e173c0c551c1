//! Runtime configuration loaded from `.aurelia/config/workflow.yaml`.
//!
//! The config is an immutable snapshot taken at startup. Unknown keys are
//! ignored so old config files keep working; invalid values are fatal before
//! any event is written.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Comparison operator of a termination condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
}

impl CompareOp {
    fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Ge => value >= threshold,
            CompareOp::Le => value <= threshold,
            CompareOp::Eq => value == threshold,
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
        }
    }
}

/// A parsed `<metric><op><number>` termination condition.
///
/// The grammar is deliberately tiny: one metric, one comparison, one number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationCondition {
    pub metric: String,
    pub op: CompareOp,
    pub threshold: f64,
}

impl TerminationCondition {
    /// Parse an expression such as `accuracy>=0.95`.
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let expr = expr.trim();
        // Two-character operators must be tried before their one-character
        // prefixes.
        let ops: [(&str, CompareOp); 5] = [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
            ("=", CompareOp::Eq),
        ];

        for (symbol, op) in ops {
            if let Some(pos) = expr.find(symbol) {
                let metric = expr[..pos].trim();
                let number = expr[pos + symbol.len()..].trim();
                if metric.is_empty() {
                    return Err(ConfigError::InvalidTermination {
                        expr: expr.to_string(),
                        reason: "missing metric name".to_string(),
                    });
                }
                let threshold =
                    number
                        .parse::<f64>()
                        .map_err(|_| ConfigError::InvalidTermination {
                            expr: expr.to_string(),
                            reason: format!("'{number}' is not a number"),
                        })?;
                return Ok(Self {
                    metric: metric.to_string(),
                    op,
                    threshold,
                });
            }
        }

        Err(ConfigError::InvalidTermination {
            expr: expr.to_string(),
            reason: "no comparison operator (expected >=, <=, =, >, or <)".to_string(),
        })
    }

    /// Evaluate the condition against a metrics map.
    ///
    /// An absent metric makes the condition false.
    pub fn satisfied_by(&self, metrics: &BTreeMap<String, f64>) -> bool {
        metrics
            .get(&self.metric)
            .is_some_and(|v| self.op.apply(*v, self.threshold))
    }
}

/// Candidate-creation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dispatcher {
    #[default]
    Default,
    Planner,
}

/// Sandbox section of the workflow config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Container image for sandboxed commands.
    pub image: String,
    /// Host environment variable names forwarded into the sandbox. Nothing
    /// else from the host environment is propagated.
    pub env_forward: Vec<String>,
    /// Memory limit passed to the container runtime.
    pub memory_limit: String,
    /// CPU limit (fractional cores).
    pub cpu_limit: f64,
    /// Whether the container gets network access.
    pub network: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "aurelia-sandbox:latest".to_string(),
            env_forward: Vec::new(),
            memory_limit: "2g".to_string(),
            cpu_limit: 1.0,
            network: false,
        }
    }
}

/// Coder section of the workflow config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoderSettings {
    /// Model identifier passed to the LLM client.
    pub model: String,
    /// Maximum conversation turns before the stage fails with
    /// `coder_turn_budget`.
    pub turn_budget: u32,
    /// Per-tool `run_command` timeout in seconds.
    pub tool_timeout_s: u64,
}

impl Default for CoderSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            turn_budget: 20,
            tool_timeout_s: 60,
        }
    }
}

/// Presubmit section of the workflow config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresubmitSettings {
    /// Shell command run in the worktree; pass iff exit code is zero.
    pub command: String,
    /// Timeout in seconds. Kept shorter than evaluation.
    pub timeout_s: u64,
}

impl Default for PresubmitSettings {
    fn default() -> Self {
        Self {
            command: "pixi run test".to_string(),
            timeout_s: 120,
        }
    }
}

/// Evaluator section of the workflow config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    /// Shell command whose stdout carries the metrics JSON.
    pub command: String,
    /// Timeout in seconds.
    pub timeout_s: u64,
    /// Path (relative to the project root) of the evaluation script whose
    /// text is shown to the coder.
    pub script: String,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            command: "pixi run evaluate".to_string(),
            timeout_s: 300,
            script: "evaluate.py".to_string(),
        }
    }
}

/// Immutable runtime configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds between heartbeat ticks (fractional values allowed).
    pub heartbeat_interval_s: f64,
    /// Upper bound on simultaneously active candidates.
    pub max_concurrent_tasks: usize,
    /// Consecutive failures since the last success that trigger drain.
    pub candidate_abandon_threshold: usize,
    /// Optional `<metric><op><number>` expression; empty disables it.
    pub termination_condition: String,
    /// Candidate-creation policy.
    pub dispatcher: Dispatcher,
    pub sandbox: SandboxSettings,
    pub coder: CoderSettings,
    pub presubmit: PresubmitSettings,
    pub evaluator: EvaluatorSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 60.0,
            max_concurrent_tasks: 4,
            candidate_abandon_threshold: 3,
            termination_condition: String::new(),
            dispatcher: Dispatcher::Default,
            sandbox: SandboxSettings::default(),
            coder: CoderSettings::default(),
            presubmit: PresubmitSettings::default(),
            evaluator: EvaluatorSettings::default(),
        }
    }
}

/// Top-level shape of `workflow.yaml`.
#[derive(Debug, Default, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    runtime: Option<RuntimeConfig>,
}

impl RuntimeConfig {
    /// Load configuration from `<aurelia_dir>/config/workflow.yaml`.
    ///
    /// A missing file yields the defaults; a malformed file or invalid value
    /// is fatal (`config_invalid`).
    pub fn load(aurelia_dir: &Path) -> Result<Self, ConfigError> {
        let path = aurelia_dir.join("config").join("workflow.yaml");
        let config = if path.exists() {
            info!(path = %path.display(), "loading workflow config");
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Unreadable {
                path: path.display().to_string(),
                source,
            })?;
            let file: WorkflowFile = serde_yaml::from_str(&raw)?;
            file.runtime.unwrap_or_default()
        } else {
            debug!(path = %path.display(), "no workflow config; using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_tasks".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.heartbeat_interval_s.is_finite() || self.heartbeat_interval_s < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_s".to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }
        if self.candidate_abandon_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "candidate_abandon_threshold".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        // Parse eagerly so a bad expression fails at startup, not mid-run.
        self.termination()?;
        Ok(())
    }

    /// The parsed termination condition, if one is configured.
    pub fn termination(&self) -> Result<Option<TerminationCondition>, ConfigError> {
        if self.termination_condition.trim().is_empty() {
            return Ok(None);
        }
        TerminationCondition::parse(&self.termination_condition).map(Some)
    }
}
