//! Core engine types v0.1.0
//!
//! Data model shared by every stage of the validate -> execute -> record
//! pipeline:
//! - Intent / OperationKind (inbound from the classifier)
//! - AccessClass (coarse risk tier)
//! - ValidationResult (per-validator verdict)
//! - Command / ExecutionResult (executor boundary)
//! - GenerationHandle (restore point)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

// =============================================================================
// Operation Kinds
// =============================================================================

/// Closed set of operations the classifier can hand to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InstallPackage,
    RemovePackage,
    SearchPackage,
    UpdateSystem,
    Rollback,
    Configure,
    StartService,
    StopService,
    ServiceStatus,
    ListInstalled,
    Help,
    Unknown,
}

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::InstallPackage,
        OperationKind::RemovePackage,
        OperationKind::SearchPackage,
        OperationKind::UpdateSystem,
        OperationKind::Rollback,
        OperationKind::Configure,
        OperationKind::StartService,
        OperationKind::StopService,
        OperationKind::ServiceStatus,
        OperationKind::ListInstalled,
        OperationKind::Help,
        OperationKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::InstallPackage => "install_package",
            OperationKind::RemovePackage => "remove_package",
            OperationKind::SearchPackage => "search_package",
            OperationKind::UpdateSystem => "update_system",
            OperationKind::Rollback => "rollback",
            OperationKind::Configure => "configure",
            OperationKind::StartService => "start_service",
            OperationKind::StopService => "stop_service",
            OperationKind::ServiceStatus => "service_status",
            OperationKind::ListInstalled => "list_installed",
            OperationKind::Help => "help",
            OperationKind::Unknown => "unknown",
        }
    }

    /// Parse a kind name; accepts both `snake_case` and `kebab-case`.
    /// Anything unrecognized becomes `Unknown`.
    pub fn parse(s: &str) -> Self {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .unwrap_or(OperationKind::Unknown)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Access Classes
// =============================================================================

/// Risk tier an operation is bucketed into for policy purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessClass {
    ReadOnly,
    InstallPackage,
    ModifyConfiguration,
    RemovePackage,
}

impl AccessClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessClass::ReadOnly => "read-only",
            AccessClass::InstallPackage => "install-package",
            AccessClass::ModifyConfiguration => "modify-configuration",
            AccessClass::RemovePackage => "remove-package",
        }
    }

    pub fn indicator(&self) -> &'static str {
        match self {
            AccessClass::ReadOnly => "[R]",
            AccessClass::InstallPackage => "[I]",
            AccessClass::ModifyConfiguration => "[C]",
            AccessClass::RemovePackage => "[X]",
        }
    }

    /// Mutating classes take the global execution lock and a restore point
    pub fn is_mutating(&self) -> bool {
        !matches!(self, AccessClass::ReadOnly)
    }
}

impl std::fmt::Display for AccessClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Intent
// =============================================================================

/// Structured request produced by the external intent classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: OperationKind,
    #[serde(default)]
    pub entities: HashMap<String, String>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub raw_text: String,
}

impl Intent {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            entities: HashMap::new(),
            confidence: 1.0,
            raw_text: String::new(),
        }
    }

    pub fn with_entity(mut self, key: &str, value: &str) -> Self {
        self.entities.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_raw_text(mut self, text: &str) -> Self {
        self.raw_text = text.to_string();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Entity value, or None when missing
    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }
}

// =============================================================================
// Validation Result
// =============================================================================

/// Verdict of a single validator, or the aggregate verdict for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_safe: bool,
    pub reason: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub const PASSED: &'static str = "validation passed";

    pub fn pass() -> Self {
        Self {
            is_safe: true,
            reason: Self::PASSED.to_string(),
            suggestions: Vec::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reason: reason.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

// =============================================================================
// Command
// =============================================================================

/// Resource ceiling attached to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_percent: u8,
    /// Bytes per second; advisory for the subprocess backend
    pub io_bandwidth: u64,
}

/// Filesystem and network view for the child
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub network_enabled: bool,
    /// Paths re-exposed read-only even when a parent is blocked
    pub read_only_paths: BTreeSet<PathBuf>,
    /// Paths hidden from the child
    pub blocked_paths: BTreeSet<PathBuf>,
    /// Paths the child may write to
    pub writable_paths: BTreeSet<PathBuf>,
}

/// Fully resolved execution unit. Arguments are always an explicit list;
/// nothing is ever passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_seconds: u32,
    pub resource_limits: ResourceLimits,
    pub sandbox: SandboxSpec,
    /// Human phrase used in previews ("install firefox")
    pub action: String,
}

impl Command {
    /// Full argument vector, executable first
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.executable.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Space-joined command line, for display only
    pub fn display(&self) -> String {
        self.argv().join(" ")
    }
}

// =============================================================================
// Execution Result
// =============================================================================

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    NonZeroExit,
    SpawnFailure,
    NativeApiUnavailable,
    Cancelled,
    SnapshotFailed,
    RollbackFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NonZeroExit => "non-zero exit",
            ErrorKind::SpawnFailure => "process spawn failure",
            ErrorKind::NativeApiUnavailable => "native API unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SnapshotFailed => "snapshot failed",
            ErrorKind::RollbackFailed => "rollback failed",
        }
    }

    /// Failure kinds that may have left the system partially changed
    pub fn may_have_mutated(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::NonZeroExit | ErrorKind::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which execution path ran a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    Subprocess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Subprocess => "subprocess",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
    /// None for dry-run previews and for failures before any backend ran
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

impl ExecutionResult {
    pub fn succeeded(stdout: String, stderr: String, duration_ms: u64, backend: BackendKind) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            exit_code: 0,
            duration_ms,
            error_kind: None,
            backend: Some(backend),
        }
    }

    pub fn failed(kind: ErrorKind, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: -1,
            duration_ms: 0,
            error_kind: Some(kind),
            backend: None,
        }
    }

    /// Synthesized result for a dry-run preview
    pub fn preview(stdout: String) -> Self {
        Self {
            success: true,
            stdout,
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 0,
            error_kind: None,
            backend: None,
        }
    }

    /// Merge the next plan step into this result
    pub fn append(&mut self, next: ExecutionResult) {
        if !next.stdout.is_empty() {
            if !self.stdout.is_empty() && !self.stdout.ends_with('\n') {
                self.stdout.push('\n');
            }
            self.stdout.push_str(&next.stdout);
        }
        if !next.stderr.is_empty() {
            if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
                self.stderr.push('\n');
            }
            self.stderr.push_str(&next.stderr);
        }
        self.success = self.success && next.success;
        self.exit_code = next.exit_code;
        self.duration_ms += next.duration_ms;
        if self.error_kind.is_none() {
            self.error_kind = next.error_kind;
        }
        if next.backend.is_some() {
            self.backend = next.backend;
        }
    }
}

// =============================================================================
// Generation Handle
// =============================================================================

/// Opaque reference to a restorable system generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationHandle {
    pub id: u64,
    pub created_at: DateTime<Utc>,
}
