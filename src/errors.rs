//! Typed error hierarchy for the conveyor engine.
//!
//! Two top-level enums cover the two subsystems:
//! - `RunnerError`: a single external-executor invocation failing
//! - `EngineError`: workflow-level failures, each mapped to a process
//!   exit code so schedulers can tell "needs a human" from "config problem"
//!
//! Rate limiting never reaches `EngineError`: the runner waits and retries
//! once inside the stage call, and only the second failure surfaces, as an
//! ordinary stage error.

use thiserror::Error;

use crate::convergence::LoopKind;

/// Errors from one external-executor invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn executor process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to write request log at {path}: {source}")]
    LogWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Executor exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Rate limited, wait {wait_secs}s before retry")]
    RateLimited { wait_secs: u64 },

    #[error("No structured output in executor response")]
    MissingPayload,

    #[error("Structured output did not match the expected shape: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Workflow-level failures. `exit_code` is the contract with callers:
/// 1 for failures and blocks, 2 for tripped iteration caps, 3 for
/// argument/lock/resume problems that precede any stage work.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Stage {stage} failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("Evaluation found blocking concerns: {}", concerns.join("; "))]
    Blocked { concerns: Vec<String> },

    #[error("{kind} loop exceeded its iteration cap of {cap}")]
    IterationCap { kind: LoopKind, cap: u32 },

    #[error("Another instance (pid {owner_pid}) holds the run lock")]
    LockConflict { owner_pid: u32 },

    #[error("Cannot resume: {reason}")]
    ResumeValidation { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Stage { .. } | EngineError::Blocked { .. } | EngineError::Other(_) => 1,
            EngineError::IterationCap { .. } => 2,
            EngineError::LockConflict { .. }
            | EngineError::ResumeValidation { .. }
            | EngineError::Config(_) => 3,
        }
    }
}

impl From<RunnerError> for EngineError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Timeout { secs } => EngineError::Stage {
                stage: "unknown".to_string(),
                reason: format!("timeout after {secs}s"),
            },
            other => EngineError::Stage {
                stage: "unknown".to_string(),
                reason: other.to_string(),
            },
        }
    }
}
