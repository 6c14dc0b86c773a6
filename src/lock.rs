//! Fleet-wide exclusion for major operations.
//!
//! At most one update run, scheduled reboot, maintenance shutdown or backup
//! runs at a time. Holding the lock is represented by an [`OperationGuard`];
//! dropping the guard releases it, so every exit path of an operation,
//! including early returns and panics, gives the lock back.
//!
//! # Example
//!
//! ```
//! use fleet_warden::OperationLock;
//!
//! let lock = OperationLock::new();
//! let guard = lock.try_acquire("backup").unwrap();
//! assert!(lock.is_held());
//! assert!(lock.try_acquire("update").is_none());
//! drop(guard);
//! assert!(!lock.is_held());
//! ```
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide "a major operation is running" flag.
///
/// Cheap to clone; clones share the same lock.
#[derive(Clone)]
pub struct OperationLock {
    permits: Arc<Semaphore>,
    holder: Arc<Mutex<Option<String>>>,
}

/// Proof that the holder owns the [`OperationLock`].
pub struct OperationGuard {
    _permit: OwnedSemaphorePermit,
    holder: Arc<Mutex<Option<String>>>,
    operation: String,
}

impl OperationLock {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Takes the lock if nobody holds it.
    pub fn try_acquire(&self, operation: &str) -> Option<OperationGuard> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        Some(self.guard(permit, operation))
    }

    /// Waits until the lock is free, then takes it.
    pub async fn acquire(&self, operation: &str) -> Result<OperationGuard> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("operation lock closed".to_string()))?;
        Ok(self.guard(permit, operation))
    }

    /// Releases the lock. Equivalent to dropping the guard.
    pub fn release(&self, guard: OperationGuard) {
        drop(guard);
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Name of the operation currently holding the lock.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn guard(&self, permit: OwnedSemaphorePermit, operation: &str) -> OperationGuard {
        *self.holder.lock().unwrap_or_else(|p| p.into_inner()) = Some(operation.to_string());
        tracing::debug!(operation, "Operation lock acquired");
        OperationGuard {
            _permit: permit,
            holder: Arc::clone(&self.holder),
            operation: operation.to_string(),
        }
    }
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGuard {
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // Cleared before the permit field drops, so a new holder never sees a stale name.
        *self.holder.lock().unwrap_or_else(|p| p.into_inner()) = None;
        tracing::debug!(operation = %self.operation, "Operation lock released");
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("operation", &self.operation)
            .finish()
    }
}
