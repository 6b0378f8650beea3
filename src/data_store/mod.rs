/// In-process reference implementation of the record store.
pub mod memory_store;
/// The versioned record model.
pub mod versioned_record;
