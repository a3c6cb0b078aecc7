//! Nixsafe Common - Safe Execution Engine v0.3.0
//!
//! Validates recognized requests, applies environment policy, and runs the
//! allow-listed system tool under a sandbox with a restore point taken
//! before every real mutation. Everything that happens is audited.

pub mod audit_log;
pub mod classifier;
pub mod command_whitelist;
pub mod config;
pub mod destructive_patterns;
pub mod engine;
pub mod error;
pub mod execution_lock;
pub mod executor_core;
pub mod generations;
pub mod input_validator;
pub mod native_backend;
pub mod policy;
pub mod progress;
pub mod redaction;
pub mod sandbox;
pub mod types;

pub use audit_log::{AuditLog, AuditOutcome, AuditRecord};
pub use classifier::{classify, classify_intent};
pub use config::EngineConfig;
pub use engine::{EngineOutcome, ExecutionReport, ExecutionRequest, RollbackOutcome, SafeExecutionEngine};
pub use error::*;
pub use executor_core::{ExecutionBackend, ExecutionContext, SandboxedExecutor};
pub use generations::{GenerationManager, GenerationProbe, GenerationRecord, GenerationStatus};
pub use native_backend::{NativeApi, NativeOutput};
pub use policy::{DiskProbe, DiskSpace, PolicyVerdict};
pub use progress::{ProgressCallback, ProgressReporter};
pub use types::*;
