use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::{Mutex, RwLock};

use crate::conflict::detection::cutoff;
use crate::operation::{Operation, OperationId};

/// Shared, individually locked operation record.
pub type OperationSlot = Arc<Mutex<Operation>>;

/// Every operation the engine has seen, kept for inspection, idempotent
/// replay and housekeeping.
pub struct OperationHistory {
    operations: RwLock<HashMap<OperationId, OperationSlot>>,
}

impl Default for OperationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationHistory {
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new operation.
    ///
    /// If the id is already known the existing slot is returned as the
    /// error and nothing is inserted. Ids are only remembered until
    /// [`purge_older_than`](Self::purge_older_than) drops them, so replay
    /// protection lasts as long as the history retention.
    pub fn begin(
        &self,
        operation: Operation,
    ) -> std::result::Result<OperationSlot, OperationSlot> {
        let mut operations = self.operations.write();
        if let Some(existing) = operations.get(&operation.id) {
            return Err(Arc::clone(existing));
        }
        let id = operation.id.clone();
        let slot = Arc::new(Mutex::new(operation));
        operations.insert(id, Arc::clone(&slot));
        Ok(slot)
    }

    /// A copy of the operation as it is right now.
    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.slot(id).map(|slot| slot.lock().clone())
    }

    pub fn slot(&self, id: &OperationId) -> Option<OperationSlot> {
        self.operations.read().get(id).cloned()
    }

    /// Removes terminal operations that ended longer than `retention` ago.
    pub fn purge_older_than(&self, retention: Duration) -> usize {
        let cutoff = cutoff(retention);
        let mut operations = self.operations.write();
        let before = operations.len();
        operations.retain(|_, slot| {
            let op = slot.lock();
            !(op.status.is_terminal() && op.ended_at.is_some_and(|ended| ended < cutoff))
        });
        before - operations.len()
    }

    pub fn len(&self) -> usize {
        self.operations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
