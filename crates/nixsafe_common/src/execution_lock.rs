//! Global execution lock
//!
//! One RwLock guards the process-wide mutable state: who is currently
//! mutating the system and which generation is current.
//! - mutating executions hold the write side for their whole lifetime
//!   (snapshot, execute, rollback, audit)
//! - read-only executions hold the read side, so they run alongside each
//!   other but never during a mutation
//!
//! Guards release on drop, which covers early returns, errors, cancellation
//! of the owning future and panics.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    /// Request currently mutating the system
    pub holder: Option<Uuid>,
    /// Last generation observed or produced by the engine
    pub current_generation: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionLock {
    inner: Arc<RwLock<LockState>>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for exclusive access
    pub async fn acquire_mutating(&self, request_id: Uuid, wait: Duration) -> Option<MutatingGuard> {
        match tokio::time::timeout(wait, self.inner.clone().write_owned()).await {
            Ok(guard) => Some(MutatingGuard::new(guard, request_id)),
            Err(_) => {
                debug!(%request_id, "timed out waiting for execution lock");
                None
            }
        }
    }

    pub fn try_acquire_mutating(&self, request_id: Uuid) -> Option<MutatingGuard> {
        self.inner
            .clone()
            .try_write_owned()
            .ok()
            .map(|guard| MutatingGuard::new(guard, request_id))
    }

    /// Shared access for read-only execution; waits out any mutation
    pub async fn acquire_shared(&self) -> SharedGuard {
        SharedGuard {
            _guard: self.inner.clone().read_owned().await,
        }
    }

    /// True while a mutation holds (or is about to take) the lock
    pub fn is_busy(&self) -> bool {
        self.inner.try_read().is_err()
    }
}

/// Exclusive access; the holder id is cleared on drop
pub struct MutatingGuard {
    guard: OwnedRwLockWriteGuard<LockState>,
}

impl MutatingGuard {
    fn new(mut guard: OwnedRwLockWriteGuard<LockState>, request_id: Uuid) -> Self {
        guard.holder = Some(request_id);
        debug!(%request_id, "execution lock acquired");
        Self { guard }
    }

    pub fn holder(&self) -> Option<Uuid> {
        self.guard.holder
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.guard.current_generation
    }

    pub fn set_current_generation(&mut self, generation: u64) {
        self.guard.current_generation = Some(generation);
    }
}

impl Drop for MutatingGuard {
    fn drop(&mut self) {
        if let Some(holder) = self.guard.holder.take() {
            debug!(request_id = %holder, "execution lock released");
        }
    }
}

/// Shared access for read-only execution
pub struct SharedGuard {
    _guard: OwnedRwLockReadGuard<LockState>,
}
