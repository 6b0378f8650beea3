use ahash::AHashMap as HashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::data_store::versioned_record::VersionedRecord;
use crate::errors::{StoreError, StoreResult};
use crate::storage::RecordStore;

/// An in-process [`RecordStore`] with a per-key conditional update.
///
/// The version check and the update happen under one mutex, which makes
/// `write_if_version` a single atomic compare-and-set from the caller's
/// point of view. Suitable for single-process deployments and tests; a
/// relational store would use `UPDATE ... WHERE version = $expected`.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, VersionedRecord>>,
}

impl MemoryRecordStore {
    /// Creates a new, empty `MemoryRecordStore`.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Provisions a record, replacing any existing state for the key.
    pub fn provision(&self, resource_key: impl Into<String>, quantity: i64, version: u64) {
        let record = VersionedRecord::new(resource_key, quantity, version);
        self.records
            .lock()
            .insert(record.resource_key().to_string(), record);
    }

    /// Returns the current state of a record, if provisioned.
    pub fn get(&self, resource_key: &str) -> Option<VersionedRecord> {
        self.records.lock().get(resource_key).cloned()
    }

    fn read_now(&self, resource_key: &str) -> StoreResult<VersionedRecord> {
        self.get(resource_key)
            .ok_or_else(|| StoreError::NotFound(resource_key.to_string()))
    }

    fn compare_and_set(
        &self,
        resource_key: &str,
        expected_version: u64,
        new_quantity: i64,
    ) -> StoreResult<u64> {
        let mut records = self.records.lock();
        let current = records
            .get_mut(resource_key)
            .ok_or_else(|| StoreError::NotFound(resource_key.to_string()))?;

        if current.version() != expected_version {
            return Err(StoreError::VersionConflict {
                current: current.clone(),
            });
        }

        *current = current.successor(new_quantity).ok_or_else(|| {
            StoreError::Backend(format!(
                "version of {} cannot advance past {}",
                resource_key,
                u64::MAX
            ))
        })?;
        Ok(current.version())
    }
}

impl RecordStore for MemoryRecordStore {
    fn read<'a>(&'a self, resource_key: &'a str) -> BoxFuture<'a, StoreResult<VersionedRecord>> {
        async move { self.read_now(resource_key) }.boxed()
    }

    fn write_if_version<'a>(
        &'a self,
        resource_key: &'a str,
        expected_version: u64,
        new_quantity: i64,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        async move { self.compare_and_set(resource_key, expected_version, new_quantity) }.boxed()
    }
}
