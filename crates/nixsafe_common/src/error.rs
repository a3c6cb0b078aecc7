//! Error taxonomy
//!
//! ValidationError and PreconditionError are always resolved inside the
//! engine and surface as structured rejections. ExecutionError travels with
//! the partial ExecutionResult. RollbackError is reported separately from the
//! failure that triggered the rollback.

use crate::types::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

/// Rejections raised while validating user-influenced data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsafe {field}: {detail}")]
    UnsafePattern { field: String, detail: String },

    #[error("invalid {field}: {detail}")]
    InvalidType { field: String, detail: String },

    #[error("request too complex: {steps} steps exceeds the limit of {max}")]
    TooComplex { steps: usize, max: usize },

    #[error("policy violation: {0}")]
    PolicyViolation(String),
}

/// Environment-level checks that block a request before execution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreconditionError {
    #[error("insufficient disk space on {path}: {free_bytes} bytes free ({ratio:.1}% of volume)")]
    InsufficientDiskSpace {
        path: PathBuf,
        free_bytes: u64,
        ratio: f64,
    },

    #[error("another system-changing operation is in progress")]
    ConcurrentOperation,

    #[error("{0} operations require explicit confirmation")]
    ConfirmationRequired(String),

    #[error("unable to check preconditions: {0}")]
    Unavailable(String),
}

/// Failures while running an already validated command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with status {code}")]
    NonZeroExit { code: i32 },

    #[error("failed to start process: {0}")]
    SpawnFailure(String),

    #[error("native API unavailable: {0}")]
    NativeApiUnavailable(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Timeout(_) => ErrorKind::Timeout,
            ExecutionError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            ExecutionError::SpawnFailure(_) | ExecutionError::SandboxUnavailable(_) => {
                ErrorKind::SpawnFailure
            }
            ExecutionError::NativeApiUnavailable(_) => ErrorKind::NativeApiUnavailable,
            ExecutionError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Failures of the generation manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RollbackError {
    #[error("invalid generation handle {requested}: current generation is {current}")]
    InvalidGenerationHandle { requested: u64, current: u64 },

    #[error("no earlier generation to roll back to (current is {0})")]
    NoPreviousGeneration(u64),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("cannot read current generation: {0}")]
    GenerationUnreadable(String),

    #[error("generation history I/O error: {0}")]
    HistoryIo(String),
}

/// Invalid or missing policy data; the engine refuses to start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}
