use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::conflict::detection::ConflictType;
use crate::errors::OperationError;
use crate::operation::OperationKind;

/// Defines how a detected conflict is resolved.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Abort the operation with a conflict error.
    Fail,
    /// Back off linearly and restart from the read step.
    Retry,
    /// Recompute against the latest state and write once more.
    Merge,
    /// Skip the in-memory lock and rely on the conditional write alone.
    ///
    /// The write still carries the originally observed version, so it can
    /// never overwrite a change committed in between; if the version moved,
    /// the operation fails with a conflict.
    Override,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Fail => "fail",
            ConflictResolution::Retry => "retry",
            ConflictResolution::Merge => "merge",
            ConflictResolution::Override => "override",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciles a proposed quantity with the latest committed one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Adds the operation's delta to the latest quantity.
    Sum,
    /// Keeps the larger of the latest and the proposed quantity.
    Max,
    /// Keeps the smaller of the latest and the proposed quantity.
    Min,
    /// Adopts the latest state and reapplies the operation on top of it.
    LastWriterWins,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Sum => "sum",
            MergeStrategy::Max => "max",
            MergeStrategy::Min => "min",
            MergeStrategy::LastWriterWins => "last_writer_wins",
        }
    }

    /// Computes the merged quantity.
    ///
    /// `previous` and `proposed` are the quantity the operation originally
    /// observed and the quantity it wanted to write; `latest` is the
    /// committed quantity it lost to.
    pub fn merge(
        &self,
        kind: OperationKind,
        requested: i64,
        previous: i64,
        proposed: i64,
        latest: i64,
    ) -> i64 {
        match self {
            MergeStrategy::Sum if kind.is_absolute() => {
                latest.saturating_add(proposed.saturating_sub(previous))
            }
            MergeStrategy::Sum | MergeStrategy::LastWriterWins => kind.apply(latest, requested),
            MergeStrategy::Max => latest.max(proposed),
            MergeStrategy::Min => latest.min(proposed),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the state machine does next after a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionStep {
    /// Give up with this error.
    Abort(OperationError),
    /// Sleep, then restart from the read step.
    RetryAfter(Duration),
    /// Recompute against the latest state and write once more.
    Merge,
    /// Proceed to the conditional write without the in-memory lock.
    Override,
}

/// Linear backoff: `retry_delay * retry_count`, no jitter.
pub fn backoff(retry_delay: Duration, retry_count: u32) -> Duration {
    retry_delay.saturating_mul(retry_count)
}

/// Chooses the next step for a conflict under `policy`.
///
/// `retry_count` is the number of retries already spent and `merged` says
/// whether the single merge attempt was already used.
pub fn decide(
    policy: &LockConfig,
    conflict_type: ConflictType,
    resource_key: &str,
    retry_count: u32,
    merged: bool,
) -> ResolutionStep {
    let conflict = || OperationError::Conflict {
        resource_key: resource_key.to_string(),
        conflict_type,
    };

    match policy.conflict_resolution {
        ConflictResolution::Fail => ResolutionStep::Abort(conflict()),
        ConflictResolution::Retry if retry_count < policy.max_retry_attempts => {
            ResolutionStep::RetryAfter(backoff(policy.retry_delay, retry_count + 1))
        }
        ConflictResolution::Retry => ResolutionStep::Abort(OperationError::RetriesExhausted {
            resource_key: resource_key.to_string(),
            attempts: retry_count,
        }),
        ConflictResolution::Merge if !merged => ResolutionStep::Merge,
        // A stale version cannot be overridden; the store would reject it again.
        ConflictResolution::Override if conflict_type == ConflictType::ConcurrentAccess => {
            ResolutionStep::Override
        }
        ConflictResolution::Merge | ConflictResolution::Override => {
            ResolutionStep::Abort(conflict())
        }
    }
}
