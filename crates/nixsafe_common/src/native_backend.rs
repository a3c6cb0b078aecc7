//! Native backend
//!
//! In-process binding to the system tool. The engine ships without a
//! concrete binding; embedders register one through `NativeApi` and the
//! executor prefers it for the commands it claims to support.

use crate::error::ExecutionError;
use crate::executor_core::{ExecutionBackend, ExecutionContext};
use crate::progress::ProgressReporter;
use crate::types::{BackendKind, Command, ExecutionResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Raw outcome of a native call, before sanitization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// An in-process API for the target tool
#[async_trait]
pub trait NativeApi: Send + Sync {
    fn name(&self) -> &str;

    /// Loaded and usable right now
    fn is_available(&self) -> bool;

    /// Whether this binding can run the given command
    fn supports(&self, command: &Command) -> bool;

    async fn invoke(
        &self,
        command: &Command,
        progress: &ProgressReporter,
    ) -> Result<NativeOutput, ExecutionError>;
}

pub struct NativeBackend {
    api: Arc<dyn NativeApi>,
}

impl NativeBackend {
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self { api }
    }

    pub fn name(&self) -> &str {
        self.api.name()
    }

    /// Available and willing to take this command
    pub fn accepts(&self, command: &Command) -> bool {
        self.api.is_available() && self.api.supports(command)
    }
}

#[async_trait]
impl ExecutionBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn run(&self, command: &Command, ctx: &ExecutionContext) -> ExecutionResult {
        if !self.api.is_available() {
            return ExecutionResult::failed(
                ExecutionError::NativeApiUnavailable(self.api.name().to_string()).kind(),
                format!("native API '{}' is not available", self.api.name()),
            );
        }

        let started = Instant::now();
        let timeout = Duration::from_secs(command.timeout_seconds as u64);
        debug!(api = self.api.name(), executable = %command.executable, "invoking native API");

        // Dropping the invoke future is how an in-process call is abandoned
        let outcome = tokio::select! {
            out = self.api.invoke(command, &ctx.progress) => Some(out),
            _ = tokio::time::sleep(timeout) => None,
            _ = ctx.cancel.cancelled() => {
                warn!("native call cancelled");
                let mut result = ExecutionResult::failed(ExecutionError::Cancelled.kind(), "execution cancelled");
                result.duration_ms = started.elapsed().as_millis() as u64;
                result.backend = Some(BackendKind::Native);
                return result;
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut result = match outcome {
            None => {
                warn!(timeout_secs = command.timeout_seconds, "native call timed out");
                ExecutionResult::failed(
                    ExecutionError::Timeout(timeout).kind(),
                    ExecutionError::Timeout(timeout).to_string(),
                )
            }
            Some(Err(e)) => ExecutionResult::failed(e.kind(), e.to_string()),
            Some(Ok(out)) if out.exit_code == 0 => {
                ExecutionResult::succeeded(out.stdout, out.stderr, duration_ms, BackendKind::Native)
            }
            Some(Ok(out)) => {
                let error = ExecutionError::NonZeroExit { code: out.exit_code };
                ExecutionResult {
                    success: false,
                    stdout: out.stdout,
                    stderr: out.stderr,
                    exit_code: out.exit_code,
                    duration_ms,
                    error_kind: Some(error.kind()),
                    backend: Some(BackendKind::Native),
                }
            }
        };
        result.duration_ms = duration_ms;
        result.backend = Some(BackendKind::Native);
        result
    }
}
