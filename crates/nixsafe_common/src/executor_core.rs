//! Executor Core - sandboxed execution with capturing
//!
//! Two backends share one contract (`ExecutionBackend::run`):
//! - NativeBackend: in-process API, preferred when available and willing
//! - SubprocessBackend: child process under the sandbox launcher
//!
//! Selection lives in `SandboxedExecutor`, outside both backends. Every
//! result leaving the executor has its stdout/stderr redacted and capped.
//! Dry runs never reach a backend.

use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::native_backend::{NativeApi, NativeBackend};
use crate::progress::ProgressReporter;
use crate::redaction::redact;
use crate::sandbox::SandboxLauncher;
use crate::types::{BackendKind, Command, ExecutionResult};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to keep draining pipes after the child exited
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Per-call context shared by both backends
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(progress: ProgressReporter, cancel: CancellationToken) -> Self {
        Self { progress, cancel }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(ProgressReporter::silent(), CancellationToken::new())
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run one command to completion, timeout or cancellation
    async fn run(&self, command: &Command, ctx: &ExecutionContext) -> ExecutionResult;
}

// =============================================================================
// Subprocess Backend
// =============================================================================

pub struct SubprocessBackend {
    launcher: SandboxLauncher,
    kill_grace: Duration,
    max_output_bytes: usize,
}

impl SubprocessBackend {
    pub fn new(launcher: SandboxLauncher, kill_grace: Duration, max_output_bytes: usize) -> Self {
        Self {
            launcher,
            kill_grace,
            max_output_bytes,
        }
    }

    /// SIGTERM the group, give it the grace period, then SIGKILL whatever is
    /// left and reap the leader
    async fn terminate_group(&self, child: &mut Child, pgid: Option<u32>) {
        if let Some(pgid) = pgid {
            let group = Pid::from_raw(pgid as i32);
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                debug!("SIGTERM to process group {} failed: {}", pgid, e);
            }

            if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
                warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
            }

            // Stragglers that outlived the leader
            let _ = killpg(group, Signal::SIGKILL);
        }

        if let Err(e) = child.kill().await {
            debug!("final kill of child failed: {}", e);
        }
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn run(&self, command: &Command, ctx: &ExecutionContext) -> ExecutionResult {
        let mut prepared = match self.launcher.prepare(command) {
            Ok(p) => p,
            Err(e) => return ExecutionResult::failed(e.kind(), e.to_string()),
        };

        let started = Instant::now();
        let mut child = match prepared.spawn() {
            Ok(c) => c,
            Err(e) => {
                let error = ExecutionError::SpawnFailure(format!("{}: {}", command.executable, e));
                warn!("{}", error);
                return ExecutionResult::failed(error.kind(), error.to_string());
            }
        };

        let pgid = child.id();
        debug!(pid = ?pgid, executable = %command.executable, "spawned child");

        let stdout = child
            .stdout
            .take()
            .map(|s| spawn_reader(s, self.max_output_bytes, ctx.progress.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|s| spawn_reader(s, self.max_output_bytes, ctx.progress.clone()));

        let timeout = Duration::from_secs(command.timeout_seconds as u64);
        let outcome: Result<std::process::ExitStatus, ExecutionError> = tokio::select! {
            status = child.wait() => status.map_err(|e| ExecutionError::SpawnFailure(e.to_string())),
            _ = tokio::time::sleep(timeout) => Err(ExecutionError::Timeout(timeout)),
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled),
        };

        if let Err(ExecutionError::Timeout(_) | ExecutionError::Cancelled) = &outcome {
            self.terminate_group(&mut child, pgid).await;
        }

        let stdout = collect_reader(stdout).await;
        let stderr = collect_reader(stderr).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(status) => {
                let code = exit_code(&status);
                if status.success() {
                    ExecutionResult::succeeded(stdout, stderr, duration_ms, BackendKind::Subprocess)
                } else {
                    ExecutionResult {
                        success: false,
                        stdout,
                        stderr,
                        exit_code: code,
                        duration_ms,
                        error_kind: Some(ExecutionError::NonZeroExit { code }.kind()),
                        backend: Some(BackendKind::Subprocess),
                    }
                }
            }
            Err(e) => {
                warn!(executable = %command.executable, "{}", e);
                let mut stderr = stderr;
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&e.to_string());
                ExecutionResult {
                    success: false,
                    stdout,
                    stderr,
                    exit_code: -1,
                    duration_ms,
                    error_kind: Some(e.kind()),
                    backend: Some(BackendKind::Subprocess),
                }
            }
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Read a pipe line by line, forwarding progress and keeping at most `cap`
/// bytes; the rest is drained and dropped.
fn spawn_reader<R>(pipe: R, cap: usize, progress: ProgressReporter) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut captured: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    progress.report_tool_line(&String::from_utf8_lossy(&line));
                    let room = cap.saturating_sub(captured.len());
                    if line.len() <= room {
                        captured.extend_from_slice(&line);
                    } else {
                        captured.extend_from_slice(&line[..room]);
                        truncated = true;
                    }
                }
            }
        }

        let mut text = String::from_utf8_lossy(&captured).into_owned();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    })
}

async fn collect_reader(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A detached descendant still holds the pipe open
            handle.abort();
            String::new()
        }
    }
}

/// Cap text at `max` bytes on a char boundary, appending a marker
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}

// =============================================================================
// Sandboxed Executor
// =============================================================================

pub struct SandboxedExecutor {
    native: Option<NativeBackend>,
    subprocess: SubprocessBackend,
    use_native: bool,
    max_output_bytes: usize,
}

impl SandboxedExecutor {
    pub fn new(config: &EngineConfig, native: Option<Arc<dyn NativeApi>>) -> Self {
        let launcher = SandboxLauncher::detect(config.sandbox.isolation, &config.execution.child_path);
        Self::with_launcher(config, native, launcher)
    }

    pub fn with_launcher(
        config: &EngineConfig,
        native: Option<Arc<dyn NativeApi>>,
        launcher: SandboxLauncher,
    ) -> Self {
        let max_output_bytes = config.execution.max_output_bytes;
        Self {
            native: native.map(NativeBackend::new),
            subprocess: SubprocessBackend::new(
                launcher,
                Duration::from_secs(config.execution.kill_grace_secs),
                max_output_bytes,
            ),
            use_native: config.execution.use_native_backend,
            max_output_bytes,
        }
    }

    /// Native if enabled, loaded and willing; subprocess otherwise
    fn select_backend(&self, command: &Command) -> &dyn ExecutionBackend {
        if self.use_native {
            if let Some(native) = &self.native {
                if native.accepts(command) {
                    debug!(api = native.name(), "selected native backend");
                    return native;
                }
            }
        }
        debug!("selected subprocess backend");
        &self.subprocess
    }

    /// Preview text for a dry run
    pub fn preview(command: &Command) -> String {
        format!("would {}\n  command: {}\n", command.action, redact(&command.display()))
    }

    pub async fn execute(&self, command: &Command, dry_run: bool, ctx: &ExecutionContext) -> ExecutionResult {
        if dry_run {
            return ExecutionResult::preview(Self::preview(command));
        }

        if ctx.cancel.is_cancelled() {
            return ExecutionResult::failed(ExecutionError::Cancelled.kind(), "execution cancelled");
        }

        let backend = self.select_backend(command);
        let mut result = backend.run(command, ctx).await;

        result.stdout = truncate_output(&redact(&result.stdout), self.max_output_bytes);
        result.stderr = truncate_output(&redact(&result.stderr), self.max_output_bytes);

        info!(
            executable = %command.executable,
            backend = backend.kind().as_str(),
            success = result.success,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "execution finished"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationMode;
    use crate::native_backend::NativeOutput;
    use crate::types::{ErrorKind, ResourceLimits, SandboxSpec};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shell(script: &str, timeout_seconds: u32) -> Command {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/run/current-system/sw/bin:/usr/bin:/bin".to_string());
        env.insert("HOME".to_string(), "/".to_string());
        Command {
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env,
            timeout_seconds,
            resource_limits: ResourceLimits {
                memory_bytes: 0,
                cpu_percent: 100,
                io_bandwidth: 0,
            },
            sandbox: SandboxSpec::default(),
            action: "run a test script".to_string(),
        }
    }

    fn executor(native: Option<Arc<dyn NativeApi>>) -> SandboxedExecutor {
        let mut config = EngineConfig::default();
        config.execution.kill_grace_secs = 1;
        config.execution.max_output_bytes = 1024;
        SandboxedExecutor::with_launcher(&config, native, SandboxLauncher::new(IsolationMode::None, None))
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl NativeApi for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn supports(&self, command: &Command) -> bool {
            command.executable == "sh"
        }
        async fn invoke(&self, _command: &Command, _progress: &ProgressReporter) -> Result<NativeOutput, ExecutionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(NativeOutput {
                stdout: "native".into(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_dry_run_never_calls_backend() {
        let api = Arc::new(Counting(AtomicUsize::new(0)));
        let exec = executor(Some(api.clone()));
        let result = exec.execute(&shell("exit 1", 5), true, &ExecutionContext::default()).await;
        assert!(result.success);
        assert!(result.stdout.starts_with("would run a test script"));
        assert_eq!(result.backend, None);
        assert_eq!(api.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_native_preferred_when_supported() {
        let api = Arc::new(Counting(AtomicUsize::new(0)));
        let exec = executor(Some(api.clone()));
        let result = exec.execute(&shell("echo sub", 5), false, &ExecutionContext::default()).await;
        assert_eq!(result.backend, Some(BackendKind::Native));
        assert_eq!(result.stdout, "native");
        assert_eq!(api.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subprocess_success() {
        let exec = executor(None);
        let result = exec.execute(&shell("echo hello", 5), false, &ExecutionContext::default()).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.backend, Some(BackendKind::Subprocess));
    }

    #[tokio::test]
    async fn test_minimal_environment() {
        std::env::set_var("NIXSAFE_TEST_SECRET", "leak");
        let exec = executor(None);
        let result = exec
            .execute(&shell("env | cut -d= -f1 | sort | tr '\\n' ' '", 5), false, &ExecutionContext::default())
            .await;
        assert!(!result.stdout.contains("NIXSAFE_TEST_SECRET"));
        assert!(result.stdout.contains("HOME"));
        assert!(result.stdout.contains("PATH"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_redacts_stderr() {
        let exec = executor(None);
        let result = exec
            .execute(&shell("echo 'password=hunter2' >&2; exit 3", 5), false, &ExecutionContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.error_kind, Some(ErrorKind::NonZeroExit));
        assert!(!result.stderr.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let exec = executor(None);
        let mut command = shell("", 5);
        command.executable = "/nonexistent/tool".to_string();
        let result = exec.execute(&command, false, &ExecutionContext::default()).await;
        assert_eq!(result.error_kind, Some(ErrorKind::SpawnFailure));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let exec = executor(None);
        let started = Instant::now();
        let result = exec.execute(&shell("sleep 30", 1), false, &ExecutionContext::default()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let exec = executor(None);
        let ctx = ExecutionContext::default();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let result = exec.execute(&shell("sleep 30", 60), false, &ctx).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_output_capped() {
        let exec = executor(None);
        let result = exec
            .execute(&shell("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done", 5), false, &ExecutionContext::default())
            .await;
        assert!(result.success);
        assert!(result.stdout.len() <= 1024 + TRUNCATION_MARKER.len());
        assert!(result.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_progress_lines_redacted() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let progress = ProgressReporter::new(Some(Arc::new(move |msg: &str, _pct: u8| {
            sink.lock().unwrap().push(msg.to_string());
        })));
        let ctx = ExecutionContext::new(progress, CancellationToken::new());

        let exec = executor(None);
        let result = exec
            .execute(&shell("echo '[1/2 built] password=hunter2'", 5), false, &ctx)
            .await;
        assert!(result.success, "{:?}", result);
        assert!(!result.stdout.contains("hunter2"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "{:?}", seen);
        assert!(seen.iter().all(|line| !line.contains("hunter2")), "{:?}", seen);
    }

    #[test]
    fn test_truncate_output_char_boundary() {
        let text = "ééé";
        let cut = truncate_output(text, 3);
        assert!(cut.starts_with('é'));
        assert!(cut.ends_with("[output truncated]"));
        assert_eq!(truncate_output("short", 10), "short");
    }
}
