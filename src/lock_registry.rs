//! In-process registry of which operations are touching which records.
//!
//! The registry is a fast path: it turns contention inside one process into
//! an immediate conflict (or a short wait) instead of a wasted round trip to
//! the store. It is not a safety guarantee across processes. Replicas of the
//! engine each have their own registry; the conditional write in
//! [`RecordStore`](crate::storage::RecordStore) is what keeps them correct.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::operation::OperationId;

/// Returned when a resource already has a holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub resource_key: String,
    pub holders: Vec<OperationId>,
}

/// A hold that was force-released because it outlived its timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLock {
    pub resource_key: String,
    pub operation_id: OperationId,
    pub held_for: Duration,
}

/// Details handed to a release hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRelease {
    pub resource_key: String,
    pub operation_id: OperationId,
    pub held_for: Duration,
}

type ReleaseHook = Box<dyn FnOnce(&LockRelease) + Send>;

struct Hold {
    acquired_at: Instant,
    lock_timeout: Duration,
    revoked: Arc<AtomicBool>,
}

/// Map from resource key to the operations currently holding it.
pub struct LockRegistry {
    holds: Mutex<HashMap<String, HashMap<OperationId, Hold>>>,
    released: Notify,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            holds: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Acquires `resource_key` for `operation_id` without waiting.
    ///
    /// A resource that already has a holder is a conflict; the caller
    /// decides whether to fail, retry, merge or wait.
    pub fn try_acquire(
        self: &Arc<Self>,
        resource_key: &str,
        operation_id: &OperationId,
        lock_timeout: Duration,
    ) -> Result<LockHandle, LockConflict> {
        let mut holds = self.holds.lock();
        let holders = holds.entry(resource_key.to_string()).or_default();

        if !holders.is_empty() {
            return Err(LockConflict {
                resource_key: resource_key.to_string(),
                holders: holders.keys().cloned().collect(),
            });
        }

        let revoked = Arc::new(AtomicBool::new(false));
        let acquired_at = Instant::now();
        holders.insert(
            operation_id.clone(),
            Hold {
                acquired_at,
                lock_timeout,
                revoked: Arc::clone(&revoked),
            },
        );
        debug!("Lock on {} acquired by {}", resource_key, operation_id);

        Ok(LockHandle {
            registry: Arc::clone(self),
            resource_key: resource_key.to_string(),
            operation_id: operation_id.clone(),
            acquired_at,
            revoked,
            on_release: None,
            released: false,
        })
    }

    /// Acquires `resource_key`, waiting up to `wait` for current holders to
    /// release it.
    pub async fn acquire_within(
        self: &Arc<Self>,
        resource_key: &str,
        operation_id: &OperationId,
        lock_timeout: Duration,
        wait: Duration,
    ) -> Result<LockHandle, LockConflict> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking so a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(resource_key, operation_id, lock_timeout) {
                Ok(handle) => return Ok(handle),
                Err(conflict) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(conflict);
                    }
                }
            }
        }
    }

    /// Operations currently holding `resource_key`.
    pub fn holders(&self, resource_key: &str) -> Vec<OperationId> {
        self.holds
            .lock()
            .get(resource_key)
            .map(|holders| holders.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of holds across all resources.
    pub fn active_locks(&self) -> usize {
        self.holds.lock().values().map(|holders| holders.len()).sum()
    }

    /// Force-releases every hold older than its lock timeout.
    ///
    /// The evicted handles observe `is_revoked() == true` and their later
    /// release is a no-op.
    pub fn reap_expired(&self) -> Vec<ExpiredLock> {
        let mut expired = Vec::new();
        {
            let mut holds = self.holds.lock();
            for (resource_key, holders) in holds.iter_mut() {
                holders.retain(|operation_id, hold| {
                    let held_for = hold.acquired_at.elapsed();
                    if held_for <= hold.lock_timeout {
                        return true;
                    }
                    hold.revoked.store(true, Ordering::SeqCst);
                    expired.push(ExpiredLock {
                        resource_key: resource_key.clone(),
                        operation_id: operation_id.clone(),
                        held_for,
                    });
                    false
                });
            }
            holds.retain(|_, holders| !holders.is_empty());
        }

        if !expired.is_empty() {
            for lock in &expired {
                warn!(
                    "Force-released lock on {} held by {} for {:?}",
                    lock.resource_key, lock.operation_id, lock.held_for
                );
            }
            self.released.notify_waiters();
        }
        expired
    }

    fn release(&self, resource_key: &str, operation_id: &OperationId) -> bool {
        let removed = {
            let mut holds = self.holds.lock();
            let removed = holds
                .get_mut(resource_key)
                .and_then(|holders| holders.remove(operation_id))
                .is_some();
            if holds.get(resource_key).is_some_and(|holders| holders.is_empty()) {
                holds.remove(resource_key);
            }
            removed
        };
        if removed {
            debug!("Lock on {} released by {}", resource_key, operation_id);
            self.released.notify_waiters();
        }
        removed
    }
}

/// Proof of holding a resource. Releases the hold when dropped.
pub struct LockHandle {
    registry: Arc<LockRegistry>,
    resource_key: String,
    operation_id: OperationId,
    acquired_at: Instant,
    revoked: Arc<AtomicBool>,
    on_release: Option<ReleaseHook>,
    released: bool,
}

impl LockHandle {
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// True once housekeeping force-released this hold.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Runs `hook` when this handle releases its hold. Not run for revoked holds.
    pub fn on_release(&mut self, hook: impl FnOnce(&LockRelease) + Send + 'static) {
        self.on_release = Some(Box::new(hook));
    }

    /// Releases the hold now and returns how long it was held.
    pub fn release(mut self) -> Duration {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Duration {
        let held_for = self.held_for();
        if self.released {
            return held_for;
        }
        self.released = true;

        if self.registry.release(&self.resource_key, &self.operation_id) {
            if let Some(hook) = self.on_release.take() {
                hook(&LockRelease {
                    resource_key: self.resource_key.clone(),
                    operation_id: self.operation_id.clone(),
                    held_for,
                });
            }
        }
        held_for
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource_key", &self.resource_key)
            .field("operation_id", &self.operation_id)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
