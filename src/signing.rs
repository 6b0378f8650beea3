//! HMAC-SHA256 signatures over completed operations.

use chrono::SecondsFormat;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::errors::{OperationError, Result};
use crate::operation::{Operation, OperationKind};

type HmacSha256 = Hmac<Sha256>;

/// Source of the key used to sign completed operations.
///
/// The secret is fetched per operation, so rotating it only needs a new
/// value from the provider.
pub trait SecretProvider: Send + Sync {
    /// Returns the current signing secret, or `None` if it is unavailable.
    fn signing_secret(&self) -> Option<Vec<u8>>;
}

/// A fixed secret, for tests and single-node setups.
#[derive(Clone)]
pub struct StaticSecret(Vec<u8>);

impl StaticSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }
}

impl SecretProvider for StaticSecret {
    fn signing_secret(&self) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecret(..)")
    }
}

/// Fields covered by the signature, serialized in this order.
#[derive(Serialize)]
struct SignedPayload<'a> {
    operation_id: &'a str,
    resource_key: &'a str,
    kind: OperationKind,
    requested_quantity: i64,
    new_quantity: Option<i64>,
    version: Option<u64>,
    actor: &'a str,
    timestamp: Option<String>,
}

fn canonical_payload(operation: &Operation) -> Result<Vec<u8>> {
    let payload = SignedPayload {
        operation_id: operation.id.as_str(),
        resource_key: &operation.resource_key,
        kind: operation.kind,
        requested_quantity: operation.requested_quantity,
        new_quantity: operation.new_quantity,
        version: operation.resulting_version,
        actor: &operation.actor,
        timestamp: operation
            .signed_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)),
    };
    serde_json::to_vec(&payload)
        .map_err(|e| OperationError::Storage(format!("cannot encode signed payload: {}", e)))
}

fn keyed_mac(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| OperationError::Configuration(format!("invalid signing secret: {}", e)))
}

/// Signs an operation, returning the hex-encoded MAC.
pub fn sign_operation(operation: &Operation, secret: &[u8]) -> Result<String> {
    let mut mac = keyed_mac(secret)?;
    mac.update(&canonical_payload(operation)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recomputes the signature of a completed operation and compares it in
/// constant time. Unsigned operations never verify.
pub fn verify_signature(operation: &Operation, secret: &[u8]) -> bool {
    let Some(signature) = operation.digital_signature.as_deref() else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let (Ok(mut mac), Ok(payload)) = (keyed_mac(secret), canonical_payload(operation)) else {
        return false;
    };
    mac.update(&payload);
    mac.verify_slice(&expected).is_ok()
}
