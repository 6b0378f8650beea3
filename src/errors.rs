use thiserror::Error;

use crate::conflict::detection::ConflictType;
use crate::data_store::versioned_record::VersionedRecord;
use crate::operation::OperationId;
use crate::validation::RuleViolation;

/// Terminal outcome of a failed operation, as seen by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Business rule validation failed: {}", describe_violations(.violations))]
    Validation { violations: Vec<RuleViolation> },

    #[error("Conflict detected on {resource_key} ({conflict_type})")]
    Conflict {
        resource_key: String,
        conflict_type: ConflictType,
    },

    #[error("Retries exhausted on {resource_key} after {attempts} attempts")]
    RetriesExhausted { resource_key: String, attempts: u32 },

    #[error("Approval denied: {reason}")]
    ApprovalDenied { reason: String },

    #[error("Approval timed out")]
    ApprovalTimeout,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lock was held past its timeout and has been force-released")]
    LockTimeout,

    #[error("Operation was cancelled before the write was issued")]
    Cancelled,

    #[error("Operation {0} is already in progress")]
    InProgress(OperationId),

    #[error("Operation {id} already failed: {reason}")]
    AlreadyFailed { id: OperationId, reason: String },
}

impl OperationError {
    /// Short machine-readable reason recorded on the failed operation.
    pub fn reason_code(&self) -> &'static str {
        match self {
            OperationError::Validation { .. } => "validation_failed",
            OperationError::Conflict { .. } => "conflict",
            OperationError::RetriesExhausted { .. } => "retries_exhausted",
            OperationError::ApprovalDenied { .. } => "approval_denied",
            OperationError::ApprovalTimeout => "approval_timeout",
            OperationError::Storage(_) => "storage_error",
            OperationError::Configuration(_) => "configuration_error",
            OperationError::LockTimeout => "lock_timeout",
            OperationError::Cancelled => "cancelled",
            OperationError::InProgress(_) => "in_progress",
            OperationError::AlreadyFailed { .. } => "already_failed",
        }
    }

    /// True for transient contention that surfaced after policy gave up.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OperationError::Conflict { .. } | OperationError::RetriesExhausted { .. }
        )
    }
}

fn describe_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, OperationError>;

/// Errors reported by a [`RecordStore`](crate::storage::RecordStore) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The conditional write lost; `current` is the authoritative state.
    #[error(
        "Version conflict on {}: current version is {}",
        .current.resource_key(),
        .current.version()
    )]
    VersionConflict { current: VersionedRecord },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Delivery failure from an audit or security event sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Event delivery failed: {0}")]
    Delivery(String),
}
