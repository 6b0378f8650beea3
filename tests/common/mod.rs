//! Common utilities for maat integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{Barrier, Notify};

use maat::approval::{ApprovalDecision, ApprovalProvider};
use maat::events::{AuditEvent, AuditSink, EngineEvent, SecurityEvent, SecurityEventSink, Severity};
use maat::operation::OperationSummary;
use maat::{
    ConflictResolution, Engine, EngineConfig, EngineDeps, LockConfig, MemoryRecordStore,
    MergeStrategy, RecordStore, ResourceClass, SinkError, StaticSecret, StoreError, StoreResult,
    VersionedRecord,
};

pub const SECRET: &[u8] = b"integration-test-secret";

// --- GatedStore ---

/// A `RecordStore` wrapping `MemoryRecordStore` with hooks for steering
/// interleavings: a barrier on the first N reads, a gate that parks writes,
/// injected write failures, writes from another process that land just
/// before ours, and a log of committed writes.
pub struct GatedStore {
    inner: MemoryRecordStore,
    read_barrier: Mutex<Option<(Arc<Barrier>, usize)>>,
    hold_writes: AtomicBool,
    write_entered: Notify,
    write_released: Notify,
    fail_writes: AtomicBool,
    foreign_writes: Mutex<Option<(usize, i64)>>,
    write_calls: AtomicUsize,
    writers: AtomicUsize,
    max_writers: AtomicUsize,
    committed: Mutex<Vec<(String, u64, i64)>>,
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            read_barrier: Mutex::new(None),
            hold_writes: AtomicBool::new(false),
            write_entered: Notify::new(),
            write_released: Notify::new(),
            fail_writes: AtomicBool::new(false),
            foreign_writes: Mutex::new(None),
            write_calls: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            max_writers: AtomicUsize::new(0),
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn provision(&self, key: &str, quantity: i64, version: u64) {
        self.inner.provision(key, quantity, version);
    }

    pub fn get(&self, key: &str) -> Option<VersionedRecord> {
        self.inner.get(key)
    }

    /// The first `readers` reads all wait for each other before returning,
    /// so they observe the same version.
    pub fn sync_first_reads(&self, readers: usize) {
        *self.read_barrier.lock().unwrap() = Some((Arc::new(Barrier::new(readers)), readers));
    }

    /// Parks every write until `release_writes` is called.
    pub fn hold_writes(&self) {
        self.hold_writes.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.hold_writes.store(false, Ordering::SeqCst);
        self.write_released.notify_waiters();
    }

    /// Resolves once a write reached the store.
    pub async fn wait_for_write(&self) {
        self.write_entered.notified().await;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The next `times` writes each lose to a writer outside the engine
    /// that moves the quantity by `delta` first.
    pub fn foreign_writes_before(&self, times: usize, delta: i64) {
        *self.foreign_writes.lock().unwrap() = (times > 0).then_some((times, delta));
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Highest number of writes that were ever in flight at once.
    pub fn max_concurrent_writers(&self) -> usize {
        self.max_writers.load(Ordering::SeqCst)
    }

    /// `(key, version, quantity)` of every successful write, in commit order.
    pub fn committed(&self) -> Vec<(String, u64, i64)> {
        self.committed.lock().unwrap().clone()
    }

    fn take_foreign_write(&self) -> Option<i64> {
        let mut slot = self.foreign_writes.lock().unwrap();
        let (remaining, delta) = slot.as_mut()?;
        let delta = *delta;
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        Some(delta)
    }

    fn take_read_barrier(&self) -> Option<Arc<Barrier>> {
        let mut slot = self.read_barrier.lock().unwrap();
        let (barrier, remaining) = slot.as_mut()?;
        let barrier = Arc::clone(barrier);
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        Some(barrier)
    }
}

impl RecordStore for GatedStore {
    fn read<'a>(&'a self, resource_key: &'a str) -> BoxFuture<'a, StoreResult<VersionedRecord>> {
        async move {
            let record = self.inner.read(resource_key).await;
            if let Some(barrier) = self.take_read_barrier() {
                barrier.wait().await;
            }
            record
        }
        .boxed()
    }

    fn write_if_version<'a>(
        &'a self,
        resource_key: &'a str,
        expected_version: u64,
        new_quantity: i64,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let in_flight = self.writers.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_writers.fetch_max(in_flight, Ordering::SeqCst);

            if self.hold_writes.load(Ordering::SeqCst) {
                self.write_entered.notify_one();
                loop {
                    let released = self.write_released.notified();
                    if !self.hold_writes.load(Ordering::SeqCst) {
                        break;
                    }
                    released.await;
                }
            }
            tokio::task::yield_now().await;

            if let Some(delta) = self.take_foreign_write() {
                if let Some(current) = self.inner.get(resource_key) {
                    self.inner
                        .write_if_version(
                            resource_key,
                            current.version(),
                            current.quantity() + delta,
                        )
                        .await
                        .expect("foreign write");
                }
            }

            let result = if self.fail_writes.load(Ordering::SeqCst) {
                Err(StoreError::Backend("connection reset".to_string()))
            } else {
                self.inner
                    .write_if_version(resource_key, expected_version, new_quantity)
                    .await
            };
            if let Ok(version) = result {
                self.committed
                    .lock()
                    .unwrap()
                    .push((resource_key.to_string(), version, new_quantity));
            }
            self.writers.fetch_sub(1, Ordering::SeqCst);
            result
        }
        .boxed()
    }
}

// --- Sinks ---

/// Collects every audit and security event in memory.
#[derive(Default)]
pub struct MemorySink {
    audit: Mutex<Vec<AuditEvent>>,
    security: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    pub fn audit_events(&self) -> Vec<EngineEvent> {
        self.audit.lock().unwrap().clone()
    }

    pub fn security_events(&self) -> Vec<EngineEvent> {
        self.security.lock().unwrap().clone()
    }

    pub fn count_audit(&self, event_type: &str) -> usize {
        self.audit
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn security_of(&self, event_type: &str) -> Vec<EngineEvent> {
        self.security
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &AuditEvent) -> Result<(), SinkError> {
        self.audit.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl SecurityEventSink for MemorySink {
    fn record(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        self.security.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Rejects every event.
pub struct FailingSink;

impl AuditSink for FailingSink {
    fn record(&self, _event: &AuditEvent) -> Result<(), SinkError> {
        Err(SinkError::Delivery("audit log unavailable".to_string()))
    }
}

impl SecurityEventSink for FailingSink {
    fn record(&self, _event: &SecurityEvent) -> Result<(), SinkError> {
        Err(SinkError::Delivery("siem unavailable".to_string()))
    }
}

pub fn has_severity(events: &[EngineEvent], severity: Severity) -> bool {
    events.iter().any(|e| e.severity == severity)
}

// --- Approval providers ---

/// Never answers.
pub struct PendingApprovals;

impl ApprovalProvider for PendingApprovals {
    fn request_approval<'a>(
        &'a self,
        _operation: &'a OperationSummary,
    ) -> BoxFuture<'a, ApprovalDecision> {
        futures::future::pending().boxed()
    }
}

/// Denies everything with a fixed reason.
pub struct DenyingApprovals(pub &'static str);

impl ApprovalProvider for DenyingApprovals {
    fn request_approval<'a>(
        &'a self,
        _operation: &'a OperationSummary,
    ) -> BoxFuture<'a, ApprovalDecision> {
        let reason = self.0.to_string();
        async move { ApprovalDecision::Denied { reason } }.boxed()
    }
}

// --- Helper Functions ---

/// Every class resolves with `resolution`, short retry delays, no approvals.
pub fn test_config(resolution: ConflictResolution) -> EngineConfig {
    let policy = LockConfig {
        conflict_resolution: resolution,
        max_retry_attempts: 10,
        retry_delay: Duration::from_millis(5),
        lock_timeout: Duration::from_secs(5),
        ..LockConfig::default()
    };
    EngineConfig::default()
        .with_class(ResourceClass::Inventory, policy.clone())
        .with_class(ResourceClass::Reservation, policy.clone())
        .with_class(
            ResourceClass::Pricing,
            LockConfig {
                merge_strategy: MergeStrategy::LastWriterWins,
                ..policy
            },
        )
}

/// Replaces the inventory policy of `config`.
pub fn with_inventory(config: EngineConfig, policy: LockConfig) -> EngineConfig {
    config.with_class(ResourceClass::Inventory, policy)
}

/// An engine wired to a fresh `GatedStore` and an in-memory sink.
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<GatedStore>,
    pub sink: Arc<MemorySink>,
}

pub fn setup_engine(config: EngineConfig) -> TestEngine {
    setup_engine_with(config, |deps| deps)
}

pub fn setup_engine_with(
    config: EngineConfig,
    customize: impl FnOnce(EngineDeps) -> EngineDeps,
) -> TestEngine {
    let store = Arc::new(GatedStore::new());
    let sink = Arc::new(MemorySink::default());
    let deps = EngineDeps::new(store.clone(), Arc::new(StaticSecret::new(SECRET)))
        .with_audit_sink(sink.clone())
        .with_security_sink(sink.clone());
    let engine = Engine::new(config, customize(deps)).expect("engine setup");
    TestEngine {
        engine,
        store,
        sink,
    }
}
