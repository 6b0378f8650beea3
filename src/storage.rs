use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, error};

use crate::data_store::versioned_record::VersionedRecord;
use crate::errors::{OperationError, Result, StoreError, StoreResult};

/// Trait for the authoritative store holding versioned records.
///
/// Implementations are responsible for durably storing each record's
/// `(quantity, version)` pair. The engine never writes through any other
/// path than [`RecordStore::write_if_version`], which must be a single
/// atomic conditional update at the storage layer (for a relational store,
/// `UPDATE ... SET quantity = $q, version = version + 1 WHERE key = $k AND
/// version = $expected`). That conditional update is what keeps writers in
/// different processes from clobbering each other; the engine's in-memory
/// lock registry only protects writers inside one process.
///
/// Implementations must be `Send` and `Sync` to be used concurrently by
/// multiple operations.
pub trait RecordStore: Send + Sync {
    /// Reads the current state of a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the record was never provisioned,
    /// or [`StoreError::Backend`] on connectivity or driver failures.
    fn read<'a>(&'a self, resource_key: &'a str) -> BoxFuture<'a, StoreResult<VersionedRecord>>;

    /// Writes `new_quantity` if, and only if, the stored version still equals
    /// `expected_version`. Returns the new version (`expected_version + 1`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] carrying the current record when
    /// the version moved, so callers can resolve without a second round trip.
    fn write_if_version<'a>(
        &'a self,
        resource_key: &'a str,
        expected_version: u64,
        new_quantity: i64,
    ) -> BoxFuture<'a, StoreResult<u64>>;
}

/// Result of a versioned write through the [`VersionStore`] adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied and produced `version`.
    Committed { version: u64 },
    /// The expected version was stale; `current` is the latest state.
    Conflict { current: VersionedRecord },
}

/// Adapter between the engine and a [`RecordStore`].
///
/// Separates version conflicts, which the conflict resolver handles, from
/// every other storage failure, which is terminal for the operation.
#[derive(Clone)]
pub struct VersionStore {
    store: Arc<dyn RecordStore>,
}

impl VersionStore {
    /// Wraps a record store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Reads `(quantity, version)` for a resource.
    pub async fn read(&self, resource_key: &str) -> Result<VersionedRecord> {
        match self.store.read(resource_key).await {
            Ok(record) => {
                debug!(
                    "Read {} at version {} (quantity {})",
                    resource_key,
                    record.version(),
                    record.quantity()
                );
                Ok(record)
            }
            Err(e) => {
                error!("Read of {} failed: {}", resource_key, e);
                Err(OperationError::Storage(e.to_string()))
            }
        }
    }

    /// Performs the conditional write.
    ///
    /// A store that reports any version other than `expected_version + 1`
    /// for a successful write is treated as a storage failure, since it
    /// breaks version monotonicity. An expected version of `u64::MAX` fails
    /// without reaching the store.
    pub async fn write_if_version(
        &self,
        resource_key: &str,
        expected_version: u64,
        new_quantity: i64,
    ) -> Result<WriteOutcome> {
        let Some(next_version) = expected_version.checked_add(1) else {
            error!(
                "Version of {} is exhausted at {}",
                resource_key, expected_version
            );
            return Err(OperationError::Storage(format!(
                "version {} of {} cannot be incremented",
                expected_version, resource_key
            )));
        };

        match self
            .store
            .write_if_version(resource_key, expected_version, new_quantity)
            .await
        {
            Ok(version) if version == next_version => {
                debug!(
                    "Committed {} = {} at version {}",
                    resource_key, new_quantity, version
                );
                Ok(WriteOutcome::Committed { version })
            }
            Ok(version) => {
                error!(
                    "Store reported version {} for a write of {} expected at {}",
                    version, resource_key, expected_version
                );
                Err(OperationError::Storage(format!(
                    "non-monotonic version {} after write expected at {}",
                    version, expected_version
                )))
            }
            Err(StoreError::VersionConflict { current }) => {
                debug!(
                    "Version conflict on {}: expected {}, found {}",
                    resource_key,
                    expected_version,
                    current.version()
                );
                Ok(WriteOutcome::Conflict { current })
            }
            Err(e) => {
                error!("Write of {} failed: {}", resource_key, e);
                Err(OperationError::Storage(e.to_string()))
            }
        }
    }
}
