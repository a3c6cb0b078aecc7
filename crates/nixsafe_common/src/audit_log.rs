//! Audit Log v0.2.0
//!
//! Append-only JSON Lines record of every request outcome: validation
//! rejections, policy rejections, dry-run previews, executions, snapshots and
//! rollbacks. Records are redacted before they are written and are never
//! rewritten afterwards.
//!
//! Storage: <state_dir>/audit/audit.jsonl (0700 directory), rotated into
//! <state_dir>/audit/archive/ at 10 MiB.

use crate::redaction::{redact, redact_env_map};
use crate::types::{AccessClass, Command, ErrorKind, ExecutionResult, OperationKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Current audit log file name
pub const AUDIT_LOG_FILE: &str = "audit.jsonl";

/// Archived audit logs directory name
pub const AUDIT_ARCHIVE_DIR: &str = "archive";

/// Maximum audit log size before rotation (10 MB)
pub const MAX_AUDIT_LOG_SIZE: u64 = 10_485_760;

/// Longest summary kept in a record
const MAX_SUMMARY_CHARS: usize = 1000;

/// What happened to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    ValidationRejected,
    PolicyRejected,
    NeedsConfirmation,
    DryRun,
    SnapshotTaken,
    Executed,
    RolledBack,
    RollbackFailed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::ValidationRejected => "validation_rejected",
            AuditOutcome::PolicyRejected => "policy_rejected",
            AuditOutcome::NeedsConfirmation => "needs_confirmation",
            AuditOutcome::DryRun => "dry_run",
            AuditOutcome::SnapshotTaken => "snapshot_taken",
            AuditOutcome::Executed => "executed",
            AuditOutcome::RolledBack => "rolled_back",
            AuditOutcome::RollbackFailed => "rollback_failed",
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Assigned by the log; strictly increasing
    #[serde(default)]
    pub sequence: u64,

    /// Assigned by the log; strictly increasing
    pub timestamp: DateTime<Utc>,

    pub request_id: Uuid,
    pub operation_kind: OperationKind,
    pub access_class: AccessClass,

    /// Redacted command line (or action phrase)
    #[serde(default)]
    pub command_summary: String,

    pub outcome: AuditOutcome,

    /// Rejection reason or sanitized failure detail
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub generation: Option<u64>,

    #[serde(default)]
    pub error_kind: Option<ErrorKind>,

    pub result_success: bool,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub user_id: Option<String>,
}

impl AuditRecord {
    pub fn new(
        request_id: Uuid,
        operation_kind: OperationKind,
        access_class: AccessClass,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            request_id,
            operation_kind,
            access_class,
            command_summary: String::new(),
            outcome,
            reason: None,
            generation: None,
            error_kind: None,
            result_success: false,
            dry_run: false,
            user_id: None,
        }
    }

    /// Set command summary (sanitized)
    pub fn with_summary(mut self, summary: &str) -> Self {
        self.command_summary = sanitize_for_audit(summary);
        self
    }

    /// Set reason (sanitized)
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(sanitize_for_audit(reason));
        self
    }

    pub fn with_generation(mut self, generation: Option<u64>) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_result(mut self, result: &ExecutionResult) -> Self {
        self.result_success = result.success;
        self.error_kind = result.error_kind;
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.result_success = success;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }
}

struct AuditState {
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Audit logger rooted at one directory
pub struct AuditLog {
    dir: PathBuf,
    state: Mutex<AuditState>,
}

impl AuditLog {
    /// Open (or prepare) the log; sequence numbering resumes after the last
    /// record already on disk.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let last = read_records(&dir.join(AUDIT_LOG_FILE)).pop();
        let state = AuditState {
            next_sequence: last.as_ref().map(|r| r.sequence + 1).unwrap_or(1),
            last_timestamp: last.map(|r| r.timestamp),
        };

        Self {
            dir,
            state: Mutex::new(state),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(AUDIT_LOG_FILE)
    }

    /// Ensure audit directory exists with proper permissions
    fn ensure_dirs(&self) -> std::io::Result<()> {
        let archive = self.dir.join(AUDIT_ARCHIVE_DIR);
        fs::create_dir_all(&archive)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(&self.dir, perms.clone())?;
            fs::set_permissions(&archive, perms)?;
        }

        Ok(())
    }

    /// Append a record. Never fails the caller: I/O problems are logged and
    /// the stamped record is still returned.
    pub fn record(&self, mut record: AuditRecord) -> AuditRecord {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Utc::now();
        record.timestamp = match state.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        record.sequence = state.next_sequence;

        state.next_sequence += 1;
        state.last_timestamp = Some(record.timestamp);

        if let Err(e) = self.append(&record) {
            warn!(
                sequence = record.sequence,
                outcome = record.outcome.as_str(),
                "failed to write audit record: {}",
                e
            );
        }

        record
    }

    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        self.ensure_dirs()?;
        self.rotate_if_needed()?;

        let json = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;

        writeln!(file, "{}", json)?;
        file.sync_all()?;

        Ok(())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }

        if fs::metadata(&path)?.len() < MAX_AUDIT_LOG_SIZE {
            return Ok(());
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.6f");
        let archive_path = self
            .dir
            .join(AUDIT_ARCHIVE_DIR)
            .join(format!("audit_{}.jsonl", timestamp));
        fs::rename(path, archive_path)?;

        Ok(())
    }

    /// Most recent records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let records = read_records(&self.log_path());
        let skip = records.len().saturating_sub(limit);
        records.into_iter().skip(skip).collect()
    }

    /// All records for one request, oldest first
    pub fn for_request(&self, request_id: Uuid) -> Vec<AuditRecord> {
        read_records(&self.log_path())
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }
}

fn read_records(path: &Path) -> Vec<AuditRecord> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Sanitize text for audit logging (redact, then cap length)
pub fn sanitize_for_audit(text: &str) -> String {
    let sanitized = redact(text);
    if sanitized.chars().count() <= MAX_SUMMARY_CHARS {
        return sanitized;
    }
    let truncated: String = sanitized.chars().take(MAX_SUMMARY_CHARS).collect();
    format!("{}... [truncated]", truncated)
}

/// One-line summary of a command with sensitive env values masked
pub fn summarize_command(command: &Command) -> String {
    let mut summary = command.display();
    if !command.env.is_empty() {
        let env = redact_env_map(&command.env)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        summary.push_str(&format!(" [env: {}]", env));
    }
    sanitize_for_audit(&summary)
}

// =============================================================================
// Tests
// =============================================================================
