//! Safety Policy Checker
//!
//! Environment-level preconditions, independent of command content:
//! - confirmation required for a configured set of access classes
//! - free space floor on the store volume (mutating classes only)
//! - no concurrent mutation
//!
//! Confirmation is a distinct verdict rather than a rejection so the caller
//! can re-submit with an explicit confirmation flag.

use crate::config::PolicyConfig;
use crate::error::PreconditionError;
use crate::execution_lock::ExecutionLock;
use crate::types::{AccessClass, ValidationResult};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Disk Probe
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskSpace {
    pub fn free_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 / self.total_bytes as f64
    }
}

/// Source of free-space figures
pub trait DiskProbe: Send + Sync {
    fn disk_space(&self, path: &Path) -> Result<DiskSpace, String>;
}

/// statvfs(3) on the configured volume
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn disk_space(&self, path: &Path) -> Result<DiskSpace, String> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| format!("{}: {}", path.display(), e))?;
        let fragment = stat.fragment_size() as u64;
        Ok(DiskSpace {
            free_bytes: stat.blocks_available() as u64 * fragment,
            total_bytes: stat.blocks() as u64 * fragment,
        })
    }
}

// =============================================================================
// Verdicts
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct PreconditionContext {
    /// The user explicitly confirmed this request
    pub confirmed: bool,
    /// Preview only; confirmation is not required for a preview
    pub dry_run: bool,
    /// The caller already holds the mutating side of the execution lock
    pub holds_execution_lock: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    Allowed,
    NeedsConfirmation(String),
    Rejected(PreconditionError),
}

impl PolicyVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyVerdict::Allowed)
    }

    pub fn to_validation_result(&self) -> ValidationResult {
        match self {
            PolicyVerdict::Allowed => ValidationResult::pass(),
            PolicyVerdict::NeedsConfirmation(reason) => ValidationResult::reject(reason.clone())
                .with_suggestion("re-submit with explicit confirmation to proceed"),
            PolicyVerdict::Rejected(e) => ValidationResult::reject(e.to_string()),
        }
    }
}

// =============================================================================
// Policy Checker
// =============================================================================

pub struct PolicyChecker {
    config: PolicyConfig,
    probe: Arc<dyn DiskProbe>,
    lock: ExecutionLock,
}

impl PolicyChecker {
    pub fn new(config: PolicyConfig, probe: Arc<dyn DiskProbe>, lock: ExecutionLock) -> Self {
        Self { config, probe, lock }
    }

    /// Confirmation, then disk space, then concurrency; first failure wins
    pub fn check_preconditions(&self, class: AccessClass, ctx: &PreconditionContext) -> PolicyVerdict {
        let verdict = self.check_confirmation(class, ctx);
        if !verdict.is_allowed() {
            return verdict;
        }

        if let Err(e) = self.check_disk_space(class) {
            return PolicyVerdict::Rejected(e);
        }

        if let Err(e) = self.check_concurrency(class, ctx) {
            return PolicyVerdict::Rejected(e);
        }

        PolicyVerdict::Allowed
    }

    pub fn requires_confirmation(&self, class: AccessClass) -> bool {
        self.config.confirm_classes.contains(&class)
    }

    pub fn check_confirmation(&self, class: AccessClass, ctx: &PreconditionContext) -> PolicyVerdict {
        if ctx.dry_run || ctx.confirmed || !self.requires_confirmation(class) {
            return PolicyVerdict::Allowed;
        }
        PolicyVerdict::NeedsConfirmation(
            PreconditionError::ConfirmationRequired(class.to_string()).to_string(),
        )
    }

    pub fn check_disk_space(&self, class: AccessClass) -> Result<(), PreconditionError> {
        if !class.is_mutating() {
            return Ok(());
        }

        let path = &self.config.disk_check_path;
        let space = self.probe.disk_space(path).map_err(|e| {
            warn!("disk space probe failed: {}", e);
            PreconditionError::Unavailable(e)
        })?;

        let ratio = space.free_ratio();
        if ratio < self.config.min_free_ratio || space.free_bytes < self.config.min_free_bytes {
            warn!(
                path = %path.display(),
                free_bytes = space.free_bytes,
                "insufficient disk space for {}",
                class
            );
            return Err(PreconditionError::InsufficientDiskSpace {
                path: path.clone(),
                free_bytes: space.free_bytes,
                ratio: ratio * 100.0,
            });
        }

        Ok(())
    }

    pub fn check_concurrency(&self, class: AccessClass, ctx: &PreconditionContext) -> Result<(), PreconditionError> {
        if !class.is_mutating() || ctx.holds_execution_lock {
            return Ok(());
        }
        if self.lock.is_busy() {
            return Err(PreconditionError::ConcurrentOperation);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;

    const GIB: u64 = 1024 * 1024 * 1024;

    pub(crate) struct FixedDisk(pub Result<DiskSpace, String>);

    impl DiskProbe for FixedDisk {
        fn disk_space(&self, _path: &Path) -> Result<DiskSpace, String> {
            self.0.clone()
        }
    }

    fn checker(free: u64, total: u64) -> (PolicyChecker, ExecutionLock) {
        let lock = ExecutionLock::new();
        let probe = Arc::new(FixedDisk(Ok(DiskSpace {
            free_bytes: free,
            total_bytes: total,
        })));
        (PolicyChecker::new(PolicyConfig::default(), probe, lock.clone()), lock)
    }

    #[test]
    fn test_read_only_always_allowed() {
        let (checker, lock) = checker(0, 100 * GIB);
        let _guard = lock.try_acquire_mutating(Uuid::new_v4());
        let verdict = checker.check_preconditions(AccessClass::ReadOnly, &PreconditionContext::default());
        assert_eq!(verdict, PolicyVerdict::Allowed);
    }

    #[test]
    fn test_install_needs_no_confirmation() {
        let (checker, _) = checker(50 * GIB, 100 * GIB);
        let verdict = checker.check_preconditions(AccessClass::InstallPackage, &PreconditionContext::default());
        assert_eq!(verdict, PolicyVerdict::Allowed);
    }

    #[test]
    fn test_remove_needs_confirmation() {
        let (checker, _) = checker(50 * GIB, 100 * GIB);
        let verdict = checker.check_preconditions(AccessClass::RemovePackage, &PreconditionContext::default());
        assert!(matches!(verdict, PolicyVerdict::NeedsConfirmation(_)));

        let confirmed = PreconditionContext {
            confirmed: true,
            ..Default::default()
        };
        assert!(checker.check_preconditions(AccessClass::RemovePackage, &confirmed).is_allowed());

        let preview = PreconditionContext {
            dry_run: true,
            ..Default::default()
        };
        assert!(checker
            .check_preconditions(AccessClass::ModifyConfiguration, &preview)
            .is_allowed());
    }

    #[test]
    fn test_low_disk_rejected() {
        let (checker, _) = checker(5 * GIB, 100 * GIB);
        let verdict = checker.check_preconditions(AccessClass::InstallPackage, &PreconditionContext::default());
        assert!(matches!(
            verdict,
            PolicyVerdict::Rejected(PreconditionError::InsufficientDiskSpace { .. })
        ));

        // Ratio fine but below the absolute floor
        let (checker, _) = self::checker(GIB, 5 * GIB);
        assert!(!checker
            .check_preconditions(AccessClass::InstallPackage, &PreconditionContext::default())
            .is_allowed());
    }

    #[test]
    fn test_probe_failure_fails_closed() {
        let checker = PolicyChecker::new(
            PolicyConfig::default(),
            Arc::new(FixedDisk(Err("no such volume".into()))),
            ExecutionLock::new(),
        );
        let verdict = checker.check_preconditions(AccessClass::InstallPackage, &PreconditionContext::default());
        assert!(matches!(verdict, PolicyVerdict::Rejected(PreconditionError::Unavailable(_))));
    }

    #[test]
    fn test_concurrent_mutation_rejected() {
        let (checker, lock) = checker(50 * GIB, 100 * GIB);
        let _guard = lock.try_acquire_mutating(Uuid::new_v4()).unwrap();

        let verdict = checker.check_preconditions(AccessClass::InstallPackage, &PreconditionContext::default());
        assert_eq!(verdict, PolicyVerdict::Rejected(PreconditionError::ConcurrentOperation));

        let holder = PreconditionContext {
            holds_execution_lock: true,
            ..Default::default()
        };
        assert!(checker.check_preconditions(AccessClass::InstallPackage, &holder).is_allowed());
    }

    #[test]
    fn test_verdict_as_validation_result() {
        let verdict = PolicyVerdict::NeedsConfirmation("remove-package operations require explicit confirmation".into());
        let result = verdict.to_validation_result();
        assert!(!result.is_safe);
        assert_eq!(result.suggestions.len(), 1);
        assert!(PolicyVerdict::Allowed.to_validation_result().is_safe);
    }

    #[test]
    fn test_statvfs_probe_on_root() {
        let space = StatvfsProbe.disk_space(Path::new("/")).unwrap();
        assert!(space.total_bytes > 0);
    }
}
