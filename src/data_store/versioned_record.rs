use serde::{Deserialize, Serialize};

/// The mutable state of one resource together with its version.
///
/// Every committed write produces a record whose version is exactly one
/// greater than the version the writer expected. The version is the guard
/// used by conditional writes; the quantity is the payload (stock units,
/// reserved units or a price in minor currency units).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Identifier of the protected record, e.g. `product:store:variant`.
    resource_key: String,
    /// The current quantity.
    quantity: i64,
    /// Monotonic version of the record.
    version: u64,
}

impl VersionedRecord {
    /// Creates a new `VersionedRecord`.
    ///
    /// # Examples
    ///
    /// ```
    /// use maat::prelude::*;
    ///
    /// let record = VersionedRecord::new("sku-1", 100, 5);
    /// assert_eq!(record.quantity(), 100);
    /// assert_eq!(record.version(), 5);
    /// ```
    pub fn new(resource_key: impl Into<String>, quantity: i64, version: u64) -> Self {
        Self {
            resource_key: resource_key.into(),
            quantity,
            version,
        }
    }

    /// Returns the resource key.
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Returns the quantity.
    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    /// Returns the version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the record that a successful write of `quantity` produces,
    /// or `None` once the version space is exhausted.
    pub fn successor(&self, quantity: i64) -> Option<Self> {
        Some(Self {
            resource_key: self.resource_key.clone(),
            quantity,
            version: self.version.checked_add(1)?,
        })
    }
}
