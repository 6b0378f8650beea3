use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ResourceClass;
use crate::data_store::versioned_record::VersionedRecord;
use crate::validation::ProposedChange;

/// Unique identifier of an operation.
///
/// Callers may supply their own identifier to make retries of the same
/// request idempotent; otherwise a random UUID is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kind of mutation an operation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Adds stock.
    Increase,
    /// Removes stock.
    Decrease,
    /// Debits stock from the resource being transferred out of.
    Transfer,
    /// Sets stock to an absolute value.
    Adjustment,
    /// Holds stock for a pending order.
    Reserve,
    /// Returns held stock.
    Release,
    /// Sets a price, in minor currency units.
    PriceUpdate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Increase => "increase",
            OperationKind::Decrease => "decrease",
            OperationKind::Transfer => "transfer",
            OperationKind::Adjustment => "adjustment",
            OperationKind::Reserve => "reserve",
            OperationKind::Release => "release",
            OperationKind::PriceUpdate => "price_update",
        }
    }

    /// The policy bucket this kind of operation is configured under.
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            OperationKind::Reserve | OperationKind::Release => ResourceClass::Reservation,
            OperationKind::PriceUpdate => ResourceClass::Pricing,
            _ => ResourceClass::Inventory,
        }
    }

    /// Absolute kinds set the quantity instead of moving it by a delta.
    pub fn is_absolute(&self) -> bool {
        matches!(self, OperationKind::Adjustment | OperationKind::PriceUpdate)
    }

    /// Computes the quantity this operation proposes on top of `current`.
    pub fn apply(&self, current: i64, requested: i64) -> i64 {
        match self {
            OperationKind::Increase | OperationKind::Release => current.saturating_add(requested),
            OperationKind::Decrease | OperationKind::Reserve | OperationKind::Transfer => {
                current.saturating_sub(requested)
            }
            OperationKind::Adjustment | OperationKind::PriceUpdate => requested,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Locked,
    Executing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Locked => "locked",
            OperationStatus::Executing => "executing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped line of an operation's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub action: String,
    pub detail: String,
}

/// The identifying part of an operation, handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub kind: OperationKind,
    pub resource_key: String,
    pub requested_quantity: i64,
    pub actor: String,
}

/// Per-call options for [`Engine::execute`](crate::engine::Engine::execute).
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Who requested the operation; part of the signed payload.
    pub actor: String,
    /// Caller-supplied identifier, used for idempotent replays.
    ///
    /// Replays are recognised only while the original operation is still in
    /// the engine's history, i.e. within `EngineConfig::history_retention`.
    /// After a purge the same id runs, and writes, again.
    pub operation_id: Option<OperationId>,
    /// Forces the approval gate even when the class policy does not.
    pub require_approval: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            actor: "system".to_string(),
            operation_id: None,
            require_approval: false,
        }
    }
}

impl ExecuteOptions {
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_operation_id(mut self, id: impl Into<OperationId>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }
}

/// One attempted mutation, driven through its lifecycle by the engine.
///
/// `new_quantity` is only meaningful once business-rule validation passed,
/// and `digital_signature` is only set once `status` is `Completed`. The
/// audit trail is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub resource_key: String,
    pub actor: String,
    pub requested_quantity: i64,
    pub previous_quantity: Option<i64>,
    pub new_quantity: Option<i64>,
    pub expected_version: Option<u64>,
    pub resulting_version: Option<u64>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub conflict_detected: bool,
    pub conflict_ids: Vec<u64>,
    pub approved: bool,
    pub digital_signature: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    audit_trail: Vec<AuditEntry>,
}

impl Operation {
    /// Creates a pending operation.
    pub fn new(
        id: OperationId,
        kind: OperationKind,
        resource_key: impl Into<String>,
        requested_quantity: i64,
        actor: impl Into<String>,
    ) -> Self {
        let mut operation = Self {
            id,
            kind,
            resource_key: resource_key.into(),
            actor: actor.into(),
            requested_quantity,
            previous_quantity: None,
            new_quantity: None,
            expected_version: None,
            resulting_version: None,
            status: OperationStatus::Pending,
            retry_count: 0,
            conflict_detected: false,
            conflict_ids: Vec::new(),
            approved: false,
            digital_signature: None,
            signed_at: None,
            failure_reason: None,
            started_at: Utc::now(),
            ended_at: None,
            audit_trail: Vec::new(),
        };
        let detail = format!(
            "{} {} on {} by {}",
            operation.kind, operation.requested_quantity, operation.resource_key, operation.actor
        );
        operation.record("created", detail);
        operation
    }

    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit_trail
    }

    /// True if any audit entry carries `action`.
    pub fn has_audit_action(&self, action: &str) -> bool {
        self.audit_trail.iter().any(|entry| entry.action == action)
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id.clone(),
            kind: self.kind,
            resource_key: self.resource_key.clone(),
            requested_quantity: self.requested_quantity,
            actor: self.actor.clone(),
        }
    }

    /// Wall-clock time since the operation started, or until it ended.
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// The change validation should judge, once state has been observed.
    pub fn proposed_change(&self) -> Option<ProposedChange> {
        Some(ProposedChange {
            kind: self.kind,
            requested_quantity: self.requested_quantity,
            previous_quantity: self.previous_quantity?,
            new_quantity: self.new_quantity?,
        })
    }

    pub(crate) fn record(&mut self, action: &str, detail: impl Into<String>) {
        self.audit_trail.push(AuditEntry {
            at: Utc::now(),
            action: action.to_string(),
            detail: detail.into(),
        });
    }

    /// Adopts freshly read state and recomputes the proposed quantity.
    pub(crate) fn observe(&mut self, current: &VersionedRecord) {
        self.previous_quantity = Some(current.quantity());
        self.expected_version = Some(current.version());
        self.new_quantity = Some(self.kind.apply(current.quantity(), self.requested_quantity));
        self.record(
            "state_read",
            format!(
                "quantity={} version={}",
                current.quantity(),
                current.version()
            ),
        );
    }

    /// Moves to a non-terminal state. Refused once the operation is terminal.
    pub(crate) fn transition(&mut self, next: OperationStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let from = self.status;
        self.status = next;
        self.record("transition", format!("{} -> {}", from, next));
        true
    }

    pub(crate) fn fail(&mut self, reason: &str, detail: &str) -> bool {
        if !self.transition(OperationStatus::Failed) {
            return false;
        }
        self.failure_reason = Some(reason.to_string());
        self.ended_at = Some(Utc::now());
        self.record("failed", format!("{}: {}", reason, detail));
        true
    }

    pub(crate) fn complete(&mut self, signature: String) -> bool {
        if !self.transition(OperationStatus::Completed) {
            return false;
        }
        self.digital_signature = Some(signature);
        self.ended_at = Some(Utc::now());
        self.record(
            "completed",
            format!(
                "quantity={} version={}",
                self.new_quantity.unwrap_or_default(),
                self.resulting_version.unwrap_or_default()
            ),
        );
        true
    }
}
