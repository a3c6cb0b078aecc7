//! Generation/Rollback Manager
//!
//! Records a restore point before every real mutating execution and can
//! return the system to it. Restoring goes through the same validation and
//! sandboxed execution as any other request.
//!
//! Generation numbers come from the system profile:
//!   /nix/var/nix/profiles/system -> system-42-link
//!   /nix/var/nix/profiles/system-41-link, system-42-link, ...
//!
//! Handle history is JSON Lines under the state directory: one line per
//! status change (pending, accepted, rolled_back), folded on read.

use crate::classifier::classify_intent;
use crate::config::EngineConfig;
use crate::error::RollbackError;
use crate::executor_core::{ExecutionContext, SandboxedExecutor};
use crate::input_validator::{entity, InputValidator};
use crate::sandbox::build_command;
use crate::types::{ExecutionResult, GenerationHandle, Intent, OperationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

// =============================================================================
// Generation Probe
// =============================================================================

/// Source of generation numbers
pub trait GenerationProbe: Send + Sync {
    /// Generation the system currently runs
    fn current(&self) -> Result<u64, String>;

    /// All generations still present, ascending
    fn list(&self) -> Result<Vec<u64>, String>;
}

/// Reads generation links next to the system profile symlink
#[derive(Debug, Clone)]
pub struct ProfileLinkProbe {
    profile: PathBuf,
}

impl ProfileLinkProbe {
    pub fn new(profile: impl Into<PathBuf>) -> Self {
        Self {
            profile: profile.into(),
        }
    }

    fn prefix(&self) -> String {
        self.profile
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "system".to_string())
    }
}

/// `system-42-link` -> 42
pub fn parse_generation_link(prefix: &str, name: &str) -> Option<u64> {
    name.strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix("-link")?
        .parse()
        .ok()
}

impl GenerationProbe for ProfileLinkProbe {
    fn current(&self) -> Result<u64, String> {
        let target = fs::read_link(&self.profile)
            .map_err(|e| format!("{}: {}", self.profile.display(), e))?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parse_generation_link(&self.prefix(), &name)
            .ok_or_else(|| format!("{} points to unexpected target {}", self.profile.display(), target.display()))
    }

    fn list(&self) -> Result<Vec<u64>, String> {
        let dir = self.profile.parent().unwrap_or_else(|| Path::new("/"));
        let prefix = self.prefix();
        let entries = fs::read_dir(dir).map_err(|e| format!("{}: {}", dir.display(), e))?;

        let mut generations: Vec<u64> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_generation_link(&prefix, &entry.file_name().to_string_lossy()))
            .collect();
        generations.sort_unstable();
        generations.dedup();
        Ok(generations)
    }
}

// =============================================================================
// History
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Snapshot taken, outcome not yet accepted
    Pending,
    Accepted,
    RolledBack,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Accepted => "accepted",
            GenerationStatus::RolledBack => "rolled back",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub status: GenerationStatus,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn handle(&self) -> GenerationHandle {
        GenerationHandle {
            id: self.id,
            created_at: self.created_at,
        }
    }
}

// =============================================================================
// Generation Manager
// =============================================================================

pub struct GenerationManager {
    probe: Arc<dyn GenerationProbe>,
    history_path: PathBuf,
    validator: Arc<InputValidator>,
    executor: Arc<SandboxedExecutor>,
    config: Arc<EngineConfig>,
}

impl GenerationManager {
    pub fn new(
        probe: Arc<dyn GenerationProbe>,
        validator: Arc<InputValidator>,
        executor: Arc<SandboxedExecutor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            probe,
            history_path: config.paths.generations_file(),
            validator,
            executor,
            config,
        }
    }

    pub fn current_generation(&self) -> Result<u64, RollbackError> {
        self.probe.current().map_err(RollbackError::GenerationUnreadable)
    }

    pub fn list_generations(&self) -> Result<Vec<u64>, RollbackError> {
        self.probe.list().map_err(RollbackError::GenerationUnreadable)
    }

    /// Record the current generation as a restore point
    pub fn snapshot(&self, request_id: Option<Uuid>) -> Result<GenerationHandle, RollbackError> {
        let id = self.current_generation()?;
        let handle = GenerationHandle {
            id,
            created_at: Utc::now(),
        };
        self.append(&handle, GenerationStatus::Pending, request_id)?;
        info!(generation = id, "snapshot taken");
        Ok(handle)
    }

    /// Keep the changes made since the snapshot
    pub fn accept(&self, handle: &GenerationHandle) -> Result<(), RollbackError> {
        self.append(handle, GenerationStatus::Accepted, None)
    }

    /// Most recent generation older than the current one
    pub fn previous_generation(&self) -> Result<GenerationHandle, RollbackError> {
        let current = self.current_generation()?;
        let previous = self
            .list_generations()?
            .into_iter()
            .filter(|g| *g < current)
            .max()
            .ok_or(RollbackError::NoPreviousGeneration(current))?;
        Ok(GenerationHandle {
            id: previous,
            created_at: Utc::now(),
        })
    }

    /// A restore target must not be newer than the current generation and
    /// must still exist. Returns the current generation.
    pub fn check_target(&self, target: u64) -> Result<u64, RollbackError> {
        let current = self.current_generation()?;
        if target > current {
            return Err(RollbackError::InvalidGenerationHandle {
                requested: target,
                current,
            });
        }
        if target != current && !self.list_generations()?.contains(&target) {
            return Err(RollbackError::RestoreFailed(format!(
                "generation {} no longer exists",
                target
            )));
        }
        Ok(current)
    }

    /// Return the system to `handle`. Restoring the generation that is
    /// already current is a no-op success.
    pub async fn rollback(
        &self,
        handle: &GenerationHandle,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, RollbackError> {
        let current = self.check_target(handle.id)?;

        if handle.id == current {
            self.append(handle, GenerationStatus::RolledBack, None)?;
            return Ok(ExecutionResult {
                success: true,
                stdout: format!("already at generation {}\n", current),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 0,
                error_kind: None,
                backend: None,
            });
        }

        let intent = Intent::new(OperationKind::Rollback)
            .with_entity(entity::GENERATION, &handle.id.to_string());
        let class = classify_intent(&intent);
        let plan = self
            .validator
            .plan(&intent, class)
            .map_err(|rejection| RollbackError::RestoreFailed(rejection.error.to_string()))?;

        info!(from = current, to = handle.id, "rolling back");

        let mut combined: Option<ExecutionResult> = None;
        for argv in &plan.steps {
            let command = build_command(argv, plan.kind, plan.access_class, &plan.action, &self.config);
            let result = self.executor.execute(&command, false, ctx).await;
            let ok = result.success;
            match combined.as_mut() {
                Some(c) => c.append(result),
                None => combined = Some(result),
            }
            if !ok {
                break;
            }
        }

        let result = combined.ok_or_else(|| RollbackError::RestoreFailed("empty restore plan".to_string()))?;
        if !result.success {
            let detail = match result.error_kind {
                Some(kind) => format!("{}: {}", kind, result.stderr.trim()),
                None => result.stderr.trim().to_string(),
            };
            error!(generation = handle.id, "rollback failed: {}", detail);
            return Err(RollbackError::RestoreFailed(detail));
        }

        let now_current = self.current_generation()?;
        if now_current != handle.id {
            error!(expected = handle.id, actual = now_current, "rollback did not switch generation");
            return Err(RollbackError::RestoreFailed(format!(
                "system is at generation {} after restore, expected {}",
                now_current, handle.id
            )));
        }

        self.append(handle, GenerationStatus::RolledBack, None)?;
        info!(generation = handle.id, "rollback complete");
        Ok(result)
    }

    /// One record per handle with its latest status, oldest first
    pub fn history(&self) -> Result<Vec<GenerationRecord>, RollbackError> {
        let content = match fs::read_to_string(&self.history_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RollbackError::HistoryIo(e.to_string())),
        };

        let mut folded: Vec<GenerationRecord> = Vec::new();
        for line in content.lines() {
            let record: GenerationRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping malformed generation history line: {}", e);
                    continue;
                }
            };
            match folded
                .iter_mut()
                .find(|r| r.id == record.id && r.created_at == record.created_at)
            {
                Some(existing) => {
                    existing.status = record.status;
                    existing.updated_at = record.updated_at;
                    if record.request_id.is_some() {
                        existing.request_id = record.request_id;
                    }
                }
                None => folded.push(record),
            }
        }
        Ok(folded)
    }

    fn append(
        &self,
        handle: &GenerationHandle,
        status: GenerationStatus,
        request_id: Option<Uuid>,
    ) -> Result<(), RollbackError> {
        let record = GenerationRecord {
            id: handle.id,
            created_at: handle.created_at,
            status,
            request_id,
            updated_at: Utc::now(),
        };
        let io = |e: std::io::Error| RollbackError::HistoryIo(e.to_string());

        if let Some(parent) = self.history_path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_string(&record).map_err(|e| RollbackError::HistoryIo(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .map_err(io)?;
        writeln!(file, "{}", json).map_err(io)?;
        file.sync_all().map_err(io)?;
        Ok(())
    }
}
