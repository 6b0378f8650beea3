use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ResourceClass;
use crate::conflict::resolution::ConflictResolution;
use crate::data_store::versioned_record::VersionedRecord;
use crate::operation::{OperationId, OperationSummary};

/// Represents the type of conflict detected.
///
/// Both variants belong to the `concurrent_access` family; the split tells
/// apart contention seen in the lock registry from a stale version seen by
/// the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Another operation in this process holds the resource.
    ConcurrentAccess,
    /// The resource was committed by someone else since it was read.
    StaleVersion,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ConcurrentAccess => "concurrent_access",
            ConflictType::StaleVersion => "stale_version",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw evidence handed to a [`ConflictClassifier`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictSignal {
    LockContention {
        holders: Vec<OperationId>,
    },
    VersionMismatch {
        expected: u64,
        current: VersionedRecord,
    },
}

/// Extension point for richer conflict classification.
pub trait ConflictClassifier: Send + Sync {
    fn classify(&self, operation: &OperationSummary, signal: &ConflictSignal) -> ConflictType;
}

/// Maps lock contention to `ConcurrentAccess` and version mismatches to
/// `StaleVersion`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ConflictClassifier for DefaultClassifier {
    fn classify(&self, _operation: &OperationSummary, signal: &ConflictSignal) -> ConflictType {
        match signal {
            ConflictSignal::LockContention { .. } => ConflictType::ConcurrentAccess,
            ConflictSignal::VersionMismatch { .. } => ConflictType::StaleVersion,
        }
    }
}

/// Evidence of a conflict between two operations on one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: u64,
    pub resource_key: String,
    pub resource_class: ResourceClass,
    /// The operation that observed the conflict.
    pub operation_a: OperationSummary,
    /// The lock holder, when it is known.
    pub operation_b: Option<OperationSummary>,
    pub conflict_type: ConflictType,
    pub resolved: bool,
    pub resolution_strategy: ConflictResolution,
    pub resolved_by: Option<OperationId>,
    /// What the resolver did, e.g. `retry in 20ms` or `aborted`.
    pub outcome: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Store of detected conflicts, kept for monitoring and audit.
pub struct ConflictLog {
    records: RwLock<Vec<ConflictRecord>>,
    next_id: AtomicU64,
}

impl Default for ConflictLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Records a newly detected, unresolved conflict and returns its id.
    pub fn record(
        &self,
        resource_class: ResourceClass,
        operation_a: OperationSummary,
        operation_b: Option<OperationSummary>,
        conflict_type: ConflictType,
        resolution_strategy: ConflictResolution,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.write().push(ConflictRecord {
            id,
            resource_key: operation_a.resource_key.clone(),
            resource_class,
            operation_a,
            operation_b,
            conflict_type,
            resolved: false,
            resolution_strategy,
            resolved_by: None,
            outcome: None,
            detected_at: Utc::now(),
            resolved_at: None,
        });
        id
    }

    pub fn set_outcome(&self, id: u64, outcome: impl Into<String>) {
        if let Some(record) = self.records.write().iter_mut().find(|r| r.id == id) {
            record.outcome = Some(outcome.into());
        }
    }

    /// Marks conflicts resolved by the operation that finally committed.
    pub fn mark_resolved(&self, ids: &[u64], resolved_by: &OperationId) {
        let now = Utc::now();
        for record in self
            .records
            .write()
            .iter_mut()
            .filter(|r| ids.contains(&r.id) && !r.resolved)
        {
            record.resolved = true;
            record.resolved_by = Some(resolved_by.clone());
            record.resolved_at = Some(now);
        }
    }

    pub fn get(&self, id: u64) -> Option<ConflictRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ConflictRecord> {
        self.records.read().clone()
    }

    pub fn unresolved_count(&self) -> usize {
        self.records.read().iter().filter(|r| !r.resolved).count()
    }

    pub fn unresolved_by_class(&self) -> HashMap<ResourceClass, usize> {
        let mut counts = HashMap::new();
        for record in self.records.read().iter().filter(|r| !r.resolved) {
            *counts.entry(record.resource_class).or_insert(0) += 1;
        }
        counts
    }

    /// Drops records detected longer than `retention` ago.
    pub fn purge_older_than(&self, retention: Duration) -> usize {
        let cutoff = cutoff(retention);
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.detected_at >= cutoff);
        before - records.len()
    }
}

pub(crate) fn cutoff(retention: Duration) -> DateTime<Utc> {
    let retention = chrono::Duration::from_std(retention)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
