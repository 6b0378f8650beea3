pub mod approval;
pub mod config;
pub mod conflict;
pub mod data_store;
pub mod engine;
pub mod errors;
pub mod events;
pub mod history;
pub mod lock_registry;
pub mod metrics;
pub mod monitor;
pub mod operation;
pub mod signing;
pub mod storage;
pub mod validation;

// Re-export key types and structs for easier access
pub use approval::{ApprovalDecision, ApprovalProvider, AutoApprove};
pub use config::{EngineConfig, LockConfig, MonitoringConfig, ResourceClass};
pub use conflict::detection::{ConflictRecord, ConflictType};
pub use conflict::resolution::{ConflictResolution, MergeStrategy};
pub use data_store::memory_store::MemoryRecordStore;
pub use data_store::versioned_record::VersionedRecord;
pub use engine::{Engine, EngineDeps, prelude};
pub use errors::{OperationError, Result, SinkError, StoreError, StoreResult};
pub use events::{AuditSink, EngineEvent, SecurityEventSink, Severity};
pub use metrics::{HealthReport, HealthStatus, HealthThresholds, Metrics};
pub use monitor::{Monitor, MonitorHandle};
pub use operation::{ExecuteOptions, Operation, OperationId, OperationKind, OperationStatus};
pub use signing::{SecretProvider, StaticSecret, verify_signature};
pub use storage::RecordStore;
