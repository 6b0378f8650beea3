use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::oneshot;

use crate::approval::{ApprovalGate, ApprovalProvider, AutoApprove};
use crate::config::{EngineConfig, LockConfig, ResourceClass};
use crate::conflict::detection::{
    ConflictClassifier, ConflictLog, ConflictRecord, ConflictSignal, ConflictType,
    DefaultClassifier,
};
use crate::conflict::resolution::{ConflictResolution, ResolutionStep, decide};
use crate::data_store::versioned_record::VersionedRecord;
use crate::errors::{OperationError, Result};
use crate::events::{
    AuditSink, EngineEvent, EventDispatcher, LoggingSink, SecurityEventSink, Severity, risk_score,
};
use crate::history::{OperationHistory, OperationSlot};
use crate::lock_registry::{ExpiredLock, LockHandle, LockRegistry};
use crate::metrics::{HealthReport, Metrics, MetricsCollector};
use crate::operation::{
    ExecuteOptions, Operation, OperationId, OperationKind, OperationStatus, OperationSummary,
};
use crate::signing::{SecretProvider, sign_operation, verify_signature};
use crate::storage::{RecordStore, VersionStore, WriteOutcome};
use crate::validation::BusinessRuleValidator;

/// Maat Prelude
pub mod prelude {
    pub use crate::approval::*;
    pub use crate::config::*;
    pub use crate::conflict::detection::*;
    pub use crate::conflict::resolution::*;
    pub use crate::data_store::memory_store::*;
    pub use crate::data_store::versioned_record::*;
    pub use crate::engine::{Engine, EngineDeps, PurgeStats, ThresholdBreach};
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::lock_registry::*;
    pub use crate::metrics::*;
    pub use crate::operation::*;
    pub use crate::signing::*;
    pub use crate::storage::*;
    pub use crate::validation::*;
}

/// Collaborators injected into an [`Engine`].
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn RecordStore>,
    pub secrets: Arc<dyn SecretProvider>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub security_sink: Arc<dyn SecurityEventSink>,
    pub approvals: Arc<dyn ApprovalProvider>,
    pub classifier: Arc<dyn ConflictClassifier>,
}

impl EngineDeps {
    /// Store and secret are required; events go to the `log` facade, every
    /// approval is granted and conflicts use the default classifier.
    pub fn new(store: Arc<dyn RecordStore>, secrets: Arc<dyn SecretProvider>) -> Self {
        Self {
            store,
            secrets,
            audit_sink: Arc::new(LoggingSink),
            security_sink: Arc::new(LoggingSink),
            approvals: Arc::new(AutoApprove),
            classifier: Arc::new(DefaultClassifier),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn with_security_sink(mut self, sink: Arc<dyn SecurityEventSink>) -> Self {
        self.security_sink = sink;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalProvider>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ConflictClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

/// A resource class whose unresolved conflicts exceed its threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdBreach {
    pub resource_class: ResourceClass,
    pub unresolved: usize,
    pub threshold: usize,
}

/// What a history purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub operations: usize,
    pub conflicts: usize,
}

/// Result of one attempt at the conditional write.
enum CommitOutcome {
    Committed,
    /// The store rejected the write; the lock (if any) is handed back so the
    /// resolver can merge under it.
    Conflict {
        current: VersionedRecord,
        lock: Option<LockHandle>,
    },
}

/// Decision taken under the operation's mutex right before the write.
enum WriteGate {
    Proceed {
        expected_version: u64,
        new_quantity: i64,
        from: OperationStatus,
    },
    Revoked,
    Terminal(Option<String>),
}

/// The entry point for executing operations against versioned records.
///
/// Cloning is cheap; clones share every piece of state. `execute` must be
/// called from within a tokio runtime.
#[derive(Clone)]
pub struct Engine {
    config: Arc<RwLock<Arc<EngineConfig>>>,
    versions: VersionStore,
    locks: Arc<LockRegistry>,
    conflicts: Arc<ConflictLog>,
    history: Arc<OperationHistory>,
    metrics: Arc<MetricsCollector>,
    events: EventDispatcher,
    secrets: Arc<dyn SecretProvider>,
    approvals: ApprovalGate,
    classifier: Arc<dyn ConflictClassifier>,
}

impl Engine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Configuration`] if `config` is invalid or the
    /// secret provider has no signing secret.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self> {
        config.validate()?;
        if !deps
            .secrets
            .signing_secret()
            .is_some_and(|secret| !secret.is_empty())
        {
            return Err(OperationError::Configuration(
                "signing secret is missing or empty".to_string(),
            ));
        }

        Ok(Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            versions: VersionStore::new(deps.store),
            locks: Arc::new(LockRegistry::new()),
            conflicts: Arc::new(ConflictLog::new()),
            history: Arc::new(OperationHistory::new()),
            metrics: Arc::new(MetricsCollector::new()),
            events: EventDispatcher::new(deps.audit_sink, deps.security_sink),
            secrets: deps.secrets,
            approvals: ApprovalGate::new(deps.approvals),
            classifier: deps.classifier,
        })
    }

    /// Runs one operation to completion and returns its id.
    ///
    /// The returned error is the operation's terminal failure; the full
    /// audit trail stays available through [`Engine::operation`]. Dropping
    /// the returned future before the write is issued marks the operation
    /// `cancelled`; once the write is in flight it always finishes.
    pub async fn execute(
        &self,
        kind: OperationKind,
        resource_key: &str,
        quantity: i64,
        options: ExecuteOptions,
    ) -> Result<OperationId> {
        let config = self.config();
        let class = kind.resource_class();
        let policy = config.lock_config(class)?.clone();
        let secret = self.signing_secret()?;

        let id = options
            .operation_id
            .clone()
            .unwrap_or_else(OperationId::generate);
        let operation = Operation::new(
            id.clone(),
            kind,
            resource_key,
            quantity,
            options.actor.clone(),
        );
        let slot = match self.history.begin(operation) {
            Ok(slot) => slot,
            Err(existing) => return self.replay(&existing),
        };
        debug!("Operation {} started: {} {} on {}", id, kind, quantity, resource_key);
        let mut created = EngineEvent::new("operation_created", Severity::Info)
            .with_resource(resource_key)
            .with_details(json!({ "kind": kind, "quantity": quantity, "actor": options.actor }));
        created.operation_id = Some(id.clone());
        self.events.audit(created);

        let mut guard = CancelGuard {
            engine: self.clone(),
            slot: Arc::clone(&slot),
            armed: true,
        };
        let needs_approval = policy.require_approval || options.require_approval;
        let result = self
            .drive(&slot, &config, class, &policy, needs_approval, secret)
            .await;
        guard.armed = false;

        match result {
            Ok(()) => Ok(id),
            Err(e) => {
                self.fail_operation(&slot, &e, &e.to_string());
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        slot: &OperationSlot,
        config: &EngineConfig,
        class: ResourceClass,
        policy: &LockConfig,
        needs_approval: bool,
        secret: Arc<[u8]>,
    ) -> Result<()> {
        let (id, resource_key) = {
            let op = slot.lock();
            (op.id.clone(), op.resource_key.clone())
        };
        let validator = BusinessRuleValidator::from_config(config);
        let mut approved = false;
        let mut merged = false;

        'attempt: loop {
            let current = self.versions.read(&resource_key).await?;
            let change = {
                let mut op = slot.lock();
                op.observe(&current);
                op.proposed_change()
            };
            if let Some(change) = change {
                validator
                    .validate(&change, policy)
                    .map_err(|violations| OperationError::Validation { violations })?;
            }

            if needs_approval && !approved {
                let summary = slot.lock().summary();
                let approver = self
                    .approvals
                    .request(&summary, config.approval_timeout)
                    .await?;
                let mut op = slot.lock();
                op.approved = true;
                op.record("approved", format!("approved by {}", approver));
                approved = true;
            }

            let mut lock = match self.locks.try_acquire(&resource_key, &id, policy.lock_timeout) {
                Ok(handle) => Some(handle),
                Err(contention) => {
                    self.metrics.record_lock_conflict();
                    let holder = contention
                        .holders
                        .first()
                        .and_then(|holder| self.history.get(holder))
                        .map(|op| op.summary());
                    let signal = ConflictSignal::LockContention {
                        holders: contention.holders,
                    };
                    let (conflict_id, conflict_type) =
                        self.register_conflict(slot, class, policy, signal, holder);
                    let step = self.resolve(slot, policy, conflict_id, conflict_type, merged);

                    match step {
                        ResolutionStep::Abort(e) => return Err(e),
                        ResolutionStep::RetryAfter(delay) => {
                            self.retry(slot, delay).await;
                            continue 'attempt;
                        }
                        ResolutionStep::Merge => {
                            merged = true;
                            self.metrics.record_merge();
                            let handle = self
                                .locks
                                .acquire_within(
                                    &resource_key,
                                    &id,
                                    policy.lock_timeout,
                                    policy.lock_timeout,
                                )
                                .await
                                .map_err(|_| OperationError::Conflict {
                                    resource_key: resource_key.clone(),
                                    conflict_type,
                                })?;
                            let latest = self.versions.read(&resource_key).await?;
                            self.apply_merge(slot, policy, &validator, &latest)?;
                            Some(handle)
                        }
                        ResolutionStep::Override => {
                            self.metrics.record_override();
                            self.note_override(slot);
                            None
                        }
                    }
                }
            };
            if let Some(handle) = lock.as_mut() {
                self.on_locked(slot, handle);
            }

            loop {
                let expected_version = slot.lock().expected_version.unwrap_or_default();
                match self.commit(slot, lock, Arc::clone(&secret)).await? {
                    CommitOutcome::Committed => return Ok(()),
                    CommitOutcome::Conflict {
                        current,
                        lock: returned,
                    } => {
                        let signal = ConflictSignal::VersionMismatch {
                            expected: expected_version,
                            current: current.clone(),
                        };
                        let (conflict_id, conflict_type) =
                            self.register_conflict(slot, class, policy, signal, None);
                        let step = self.resolve(slot, policy, conflict_id, conflict_type, merged);

                        match step {
                            ResolutionStep::Merge => {
                                merged = true;
                                self.metrics.record_merge();
                                self.apply_merge(slot, policy, &validator, &current)?;
                                lock = returned;
                            }
                            ResolutionStep::RetryAfter(delay) => {
                                drop(returned);
                                self.retry(slot, delay).await;
                                continue 'attempt;
                            }
                            ResolutionStep::Abort(e) => return Err(e),
                            ResolutionStep::Override => {
                                return Err(OperationError::Conflict {
                                    resource_key,
                                    conflict_type,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Runs the write and everything after it on a spawned task, so a caller
    /// that goes away mid-write cannot leave a half-finished operation.
    async fn commit(
        &self,
        slot: &OperationSlot,
        lock: Option<LockHandle>,
        secret: Arc<[u8]>,
    ) -> Result<CommitOutcome> {
        let (tx, rx) = oneshot::channel();
        let engine = self.clone();
        let slot = Arc::clone(slot);

        tokio::spawn(async move {
            let outcome = engine.write_and_finalize(&slot, lock, &secret).await;
            if let Err(Ok(CommitOutcome::Conflict { lock, .. })) = tx.send(outcome) {
                drop(lock);
                engine.fail_operation(
                    &slot,
                    &OperationError::Cancelled,
                    "caller went away after a version conflict",
                );
            }
        });

        rx.await.map_err(|_| {
            OperationError::Storage("commit task stopped before reporting an outcome".to_string())
        })?
    }

    async fn write_and_finalize(
        &self,
        slot: &OperationSlot,
        lock: Option<LockHandle>,
        secret: &[u8],
    ) -> Result<CommitOutcome> {
        let gate = {
            let mut op = slot.lock();
            if lock.as_ref().is_some_and(LockHandle::is_revoked) {
                WriteGate::Revoked
            } else if op.status.is_terminal() {
                WriteGate::Terminal(op.failure_reason.clone())
            } else {
                match (op.expected_version, op.new_quantity) {
                    (Some(expected_version), Some(new_quantity)) => {
                        let from = op.status;
                        op.transition(OperationStatus::Executing);
                        WriteGate::Proceed {
                            expected_version,
                            new_quantity,
                            from,
                        }
                    }
                    _ => WriteGate::Terminal(None),
                }
            }
        };

        let (expected_version, new_quantity) = match gate {
            WriteGate::Proceed {
                expected_version,
                new_quantity,
                from,
            } => {
                self.announce(slot, from, OperationStatus::Executing);
                (expected_version, new_quantity)
            }
            WriteGate::Revoked => {
                drop(lock);
                self.fail_operation(
                    slot,
                    &OperationError::LockTimeout,
                    "lock revoked before the write was issued",
                );
                return Err(OperationError::LockTimeout);
            }
            WriteGate::Terminal(reason) => {
                drop(lock);
                return Err(match reason.as_deref() {
                    Some("lock_timeout") => OperationError::LockTimeout,
                    Some("cancelled") | None => OperationError::Cancelled,
                    Some(other) => OperationError::Storage(format!(
                        "operation ended ({}) before the write was issued",
                        other
                    )),
                });
            }
        };

        let resource_key = slot.lock().resource_key.clone();
        let written = self
            .versions
            .write_if_version(&resource_key, expected_version, new_quantity)
            .await;

        match written {
            Err(e) => {
                if let Some(handle) = lock {
                    handle.release();
                }
                self.fail_operation(slot, &e, "conditional write failed");
                Err(e)
            }
            Ok(WriteOutcome::Conflict { current }) => {
                self.metrics.record_version_conflict();
                if lock.as_ref().is_some_and(LockHandle::is_revoked) {
                    drop(lock);
                    self.fail_operation(
                        slot,
                        &OperationError::LockTimeout,
                        "lock revoked while the write was in flight",
                    );
                    return Err(OperationError::LockTimeout);
                }
                let back = if lock.is_some() {
                    OperationStatus::Locked
                } else {
                    OperationStatus::Pending
                };
                self.transition(slot, back);
                Ok(CommitOutcome::Conflict { current, lock })
            }
            Ok(WriteOutcome::Committed { version }) => self.finalize(slot, lock, version, secret),
        }
    }

    fn finalize(
        &self,
        slot: &OperationSlot,
        lock: Option<LockHandle>,
        version: u64,
        secret: &[u8],
    ) -> Result<CommitOutcome> {
        if lock.as_ref().is_some_and(LockHandle::is_revoked) {
            drop(lock);
            return Err(self.write_after_revocation(slot, version));
        }

        let signature = {
            let mut op = slot.lock();
            if op.status.is_terminal() {
                None
            } else {
                op.resulting_version = Some(version);
                op.signed_at = Some(Utc::now());
                Some(sign_operation(&op, secret))
            }
        };
        let signature = match signature {
            Some(Ok(signature)) => signature,
            Some(Err(e)) => {
                drop(lock);
                self.fail_operation(slot, &e, "signing failed after the write");
                return Err(e);
            }
            None => {
                drop(lock);
                return Err(self.write_after_revocation(slot, version));
            }
        };

        if let Some(handle) = lock {
            handle.release();
        }

        let completed = {
            let mut op = slot.lock();
            if op.complete(signature) {
                Some(op.clone())
            } else {
                None
            }
        };
        let Some(op) = completed else {
            return Err(self.write_after_revocation(slot, version));
        };

        self.announce(slot, OperationStatus::Executing, OperationStatus::Completed);
        self.conflicts.mark_resolved(&op.conflict_ids, &op.id);
        self.metrics.record_operation(true, op.elapsed());

        let overridden = op
            .has_audit_action("lock_override")
            .then_some(ConflictResolution::Override);
        self.events.security(
            EngineEvent::new("operation_completed", Severity::Info)
                .for_operation(&op)
                .with_risk_score(risk_score(&op, overridden))
                .with_details(json!({
                    "kind": op.kind,
                    "previous_quantity": op.previous_quantity,
                    "new_quantity": op.new_quantity,
                    "version": op.resulting_version,
                    "retry_count": op.retry_count,
                    "conflict_detected": op.conflict_detected,
                    "actor": op.actor,
                })),
        );
        info!(
            "Operation {} completed: {} = {:?} at version {}",
            op.id, op.resource_key, op.new_quantity, version
        );
        Ok(CommitOutcome::Committed)
    }

    /// Records a write that landed after housekeeping revoked the lock. The
    /// operation stays failed with `lock_timeout`.
    fn write_after_revocation(&self, slot: &OperationSlot, version: u64) -> OperationError {
        let op = {
            let mut op = slot.lock();
            let detail = format!(
                "quantity={} version={}",
                op.new_quantity.unwrap_or_default(),
                version
            );
            op.record("write_completed_after_revocation", detail);
            op.summary()
        };
        self.fail_operation(
            slot,
            &OperationError::LockTimeout,
            "lock revoked while the write was in flight",
        );
        error!(
            "Write of {} by {} landed at version {} after its lock was revoked",
            op.resource_key, op.id, version
        );
        self.events.security(
            EngineEvent::new("write_after_lock_revocation", Severity::Critical)
                .with_resource(op.resource_key.clone())
                .with_details(json!({
                    "operation_id": op.id,
                    "version": version,
                    "action": "reconcile",
                }))
                .with_risk_score(100),
        );
        OperationError::LockTimeout
    }

    fn register_conflict(
        &self,
        slot: &OperationSlot,
        class: ResourceClass,
        policy: &LockConfig,
        signal: ConflictSignal,
        holder: Option<OperationSummary>,
    ) -> (u64, ConflictType) {
        let summary = slot.lock().summary();
        let conflict_type = self.classifier.classify(&summary, &signal);
        let conflict_id = self.conflicts.record(
            class,
            summary.clone(),
            holder,
            conflict_type,
            policy.conflict_resolution,
        );

        let detail = match &signal {
            ConflictSignal::LockContention { holders } => format!(
                "held by {}",
                holders
                    .iter()
                    .map(|h| h.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ConflictSignal::VersionMismatch { expected, current } => format!(
                "expected version {}, found {}",
                expected,
                current.version()
            ),
        };
        {
            let mut op = slot.lock();
            op.conflict_detected = true;
            op.conflict_ids.push(conflict_id);
            op.record("conflict_detected", format!("{}: {}", conflict_type, detail));
        }
        warn!(
            "Conflict on {} for {}: {} ({})",
            summary.resource_key, summary.id, conflict_type, detail
        );
        self.events.audit(
            EngineEvent::new("conflict_detected", Severity::Warning)
                .with_resource(summary.resource_key.clone())
                .with_details(json!({
                    "operation_id": summary.id,
                    "conflict_id": conflict_id,
                    "conflict_type": conflict_type,
                    "detail": detail,
                })),
        );
        (conflict_id, conflict_type)
    }

    fn resolve(
        &self,
        slot: &OperationSlot,
        policy: &LockConfig,
        conflict_id: u64,
        conflict_type: ConflictType,
        merged: bool,
    ) -> ResolutionStep {
        let (resource_key, retry_count) = {
            let op = slot.lock();
            (op.resource_key.clone(), op.retry_count)
        };
        let step = decide(policy, conflict_type, &resource_key, retry_count, merged);
        let outcome = match &step {
            ResolutionStep::Abort(e) => format!("aborted: {}", e.reason_code()),
            ResolutionStep::RetryAfter(delay) => format!("retry in {}ms", delay.as_millis()),
            ResolutionStep::Merge => format!("merge ({})", policy.merge_strategy),
            ResolutionStep::Override => "override".to_string(),
        };
        self.conflicts.set_outcome(conflict_id, outcome.clone());
        slot.lock().record("conflict_resolution", outcome);
        step
    }

    async fn retry(&self, slot: &OperationSlot, delay: Duration) {
        {
            let mut op = slot.lock();
            op.retry_count += 1;
            let attempt = op.retry_count;
            op.record("retry", format!("attempt {} after {:?}", attempt, delay));
        }
        self.transition(slot, OperationStatus::Pending);
        self.metrics.record_retry();
        tokio::time::sleep(delay).await;
    }

    /// Recomputes the proposal against `latest` with the class's merge
    /// strategy and validates the merged result.
    fn apply_merge(
        &self,
        slot: &OperationSlot,
        policy: &LockConfig,
        validator: &BusinessRuleValidator,
        latest: &VersionedRecord,
    ) -> Result<()> {
        let change = {
            let mut op = slot.lock();
            let previous = op.previous_quantity.unwrap_or(latest.quantity());
            let proposed = op.new_quantity.unwrap_or(previous);
            let merged = policy.merge_strategy.merge(
                op.kind,
                op.requested_quantity,
                previous,
                proposed,
                latest.quantity(),
            );
            op.previous_quantity = Some(latest.quantity());
            op.expected_version = Some(latest.version());
            op.new_quantity = Some(merged);
            op.record(
                "merged",
                format!(
                    "{}: latest={} version={} proposed={} merged={}",
                    policy.merge_strategy,
                    latest.quantity(),
                    latest.version(),
                    proposed,
                    merged
                ),
            );
            op.proposed_change()
        };
        if let Some(change) = change {
            validator
                .validate(&change, policy)
                .map_err(|violations| OperationError::Validation { violations })?;
        }
        Ok(())
    }

    fn note_override(&self, slot: &OperationSlot) {
        let summary = {
            let mut op = slot.lock();
            op.record(
                "lock_override",
                "proceeding without the lock; the conditional write still applies",
            );
            op.summary()
        };
        warn!(
            "Operation {} overrides the lock on {}",
            summary.id, summary.resource_key
        );
        self.events.security(
            EngineEvent::new("lock_override", Severity::High)
                .with_resource(summary.resource_key.clone())
                .with_details(json!({ "operation_id": summary.id, "actor": summary.actor }))
                .with_risk_score(60),
        );
    }

    fn on_locked(&self, slot: &OperationSlot, handle: &mut LockHandle) {
        self.metrics.record_lock_acquired();
        let metrics = Arc::clone(&self.metrics);
        let owner = Arc::clone(slot);
        handle.on_release(move |release| {
            metrics.record_lock_released(release.held_for);
            owner
                .lock()
                .record("lock_released", format!("held for {:?}", release.held_for));
        });
        slot.lock()
            .record("lock_acquired", handle.resource_key().to_string());
        self.transition(slot, OperationStatus::Locked);
    }

    /// Moves a non-terminal operation to `next` and emits an audit event.
    fn transition(&self, slot: &OperationSlot, next: OperationStatus) -> bool {
        let from = {
            let mut op = slot.lock();
            let from = op.status;
            if from == next {
                return true;
            }
            if !op.transition(next) {
                return false;
            }
            from
        };
        self.announce(slot, from, next);
        true
    }

    fn announce(&self, slot: &OperationSlot, from: OperationStatus, to: OperationStatus) {
        let (id, resource_key) = {
            let op = slot.lock();
            (op.id.clone(), op.resource_key.clone())
        };
        debug!("Operation {} on {}: {} -> {}", id, resource_key, from, to);
        let mut event = EngineEvent::new("transition", Severity::Info)
            .with_resource(resource_key)
            .with_details(json!({ "from": from, "to": to }));
        event.operation_id = Some(id);
        self.events.audit(event);
    }

    /// Fails a non-terminal operation. Returns false if it already ended.
    fn fail_operation(&self, slot: &OperationSlot, err: &OperationError, detail: &str) -> bool {
        self.fail_operation_if(slot, err, detail, |_| true)
    }

    fn fail_operation_if(
        &self,
        slot: &OperationSlot,
        err: &OperationError,
        detail: &str,
        allowed: impl FnOnce(OperationStatus) -> bool,
    ) -> bool {
        let failed = {
            let mut op = slot.lock();
            let from = op.status;
            if from.is_terminal() || !allowed(from) || !op.fail(err.reason_code(), detail) {
                return false;
            }
            (op.id.clone(), op.resource_key.clone(), from, op.elapsed())
        };
        let (id, resource_key, from, elapsed) = failed;

        self.metrics.record_operation(false, elapsed);
        warn!(
            "Operation {} on {} failed ({}): {}",
            id,
            resource_key,
            err.reason_code(),
            detail
        );
        let mut event = EngineEvent::new("transition", Severity::Warning)
            .with_resource(resource_key)
            .with_details(json!({
                "from": from,
                "to": OperationStatus::Failed,
                "reason": err.reason_code(),
                "detail": detail,
            }));
        event.operation_id = Some(id);
        self.events.audit(event);
        true
    }

    fn replay(&self, existing: &OperationSlot) -> Result<OperationId> {
        let mut op = existing.lock();
        let status = op.status;
        match status {
            OperationStatus::Completed => {
                op.record("replay_ignored", "operation already completed");
                info!("Replay of completed operation {} ignored", op.id);
                let mut event = EngineEvent::new("replay_ignored", Severity::Info)
                    .with_resource(op.resource_key.clone());
                event.operation_id = Some(op.id.clone());
                let id = op.id.clone();
                drop(op);
                self.events.audit(event);
                Ok(id)
            }
            OperationStatus::Failed => Err(OperationError::AlreadyFailed {
                id: op.id.clone(),
                reason: op.failure_reason.clone().unwrap_or_default(),
            }),
            _ => Err(OperationError::InProgress(op.id.clone())),
        }
    }

    fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config.read())
    }

    fn signing_secret(&self) -> Result<Arc<[u8]>> {
        self.secrets
            .signing_secret()
            .filter(|secret| !secret.is_empty())
            .map(Arc::from)
            .ok_or_else(|| {
                OperationError::Configuration("signing secret is unavailable".to_string())
            })
    }

    /// Current snapshot of the engine's statistics.
    pub fn get_stats(&self) -> Metrics {
        self.metrics.snapshot()
    }

    pub fn reset_stats(&self) {
        self.metrics.reset();
    }

    pub fn health_check(&self) -> HealthReport {
        let stats = self.metrics.snapshot();
        let unresolved_conflicts = self.conflicts.unresolved_count();
        HealthReport {
            status: self.config().health.assess(&stats, unresolved_conflicts),
            unresolved_conflicts,
            stats,
        }
    }

    pub fn operation(&self, id: &OperationId) -> Option<Operation> {
        self.history.get(id)
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.snapshot()
    }

    pub fn active_locks(&self) -> usize {
        self.locks.active_locks()
    }

    /// Checks a completed operation's signature against the current secret.
    pub fn verify_signature(&self, operation: &Operation) -> bool {
        match self.signing_secret() {
            Ok(secret) => verify_signature(operation, &secret),
            Err(_) => false,
        }
    }

    /// Validates and swaps in a new configuration. Operations already
    /// running keep the policy they started with.
    pub fn reload_config(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = Arc::new(config);
        info!("Engine configuration reloaded");
        Ok(())
    }

    /// Compares unresolved conflicts per resource class with the class's
    /// `conflict_threshold` and raises a warning for every breach.
    pub fn check_conflict_thresholds(&self) -> Vec<ThresholdBreach> {
        let config = self.config();
        let mut breaches = Vec::new();
        for (class, unresolved) in self.conflicts.unresolved_by_class() {
            let Ok(policy) = config.lock_config(class) else {
                continue;
            };
            if unresolved > policy.conflict_threshold {
                breaches.push(ThresholdBreach {
                    resource_class: class,
                    unresolved,
                    threshold: policy.conflict_threshold,
                });
            }
        }
        breaches.sort_by_key(|b| b.resource_class.as_str());

        for breach in &breaches {
            warn!(
                "{} unresolved conflicts on {} exceed threshold {}",
                breach.unresolved, breach.resource_class, breach.threshold
            );
            self.events.security(
                EngineEvent::new("conflict_threshold_exceeded", Severity::Warning)
                    .with_details(json!({
                        "resource_class": breach.resource_class,
                        "unresolved": breach.unresolved,
                        "threshold": breach.threshold,
                    }))
                    .with_risk_score(50),
            );
        }
        breaches
    }

    /// Drops terminal operations and conflict records older than the
    /// configured retention.
    pub fn purge_history(&self) -> PurgeStats {
        let retention = self.config().history_retention;
        let stats = PurgeStats {
            operations: self.history.purge_older_than(retention),
            conflicts: self.conflicts.purge_older_than(retention),
        };
        if stats.operations > 0 || stats.conflicts > 0 {
            debug!(
                "Purged {} operations and {} conflict records",
                stats.operations, stats.conflicts
            );
        }
        stats
    }

    pub fn refresh_throughput(&self) -> f64 {
        self.metrics.refresh_throughput()
    }

    /// Force-releases locks held past their timeout and fails their owners
    /// with `lock_timeout`.
    pub fn reap_expired_locks(&self) -> Vec<ExpiredLock> {
        let expired = self.locks.reap_expired();
        for lock in &expired {
            self.metrics.record_lock_timeout();
            if let Some(slot) = self.history.slot(&lock.operation_id) {
                slot.lock().record(
                    "lock_force_released",
                    format!("held for {:?}", lock.held_for),
                );
                self.fail_operation(
                    &slot,
                    &OperationError::LockTimeout,
                    "lock held past its timeout",
                );
            }
            self.events.security(
                EngineEvent::new("lock_timeout", Severity::High)
                    .with_resource(lock.resource_key.clone())
                    .with_details(json!({
                        "operation_id": lock.operation_id,
                        "held_ms": lock.held_for.as_millis() as u64,
                    }))
                    .with_risk_score(70),
            );
        }
        expired
    }
}

/// Marks the operation `cancelled` if the `execute` future is dropped
/// before the write was issued.
struct CancelGuard {
    engine: Engine,
    slot: OperationSlot,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.engine.fail_operation_if(
            &self.slot,
            &OperationError::Cancelled,
            "caller dropped the operation before the write",
            |status| status != OperationStatus::Executing,
        );
    }
}
