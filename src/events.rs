//! Audit and security events, and the sinks that receive them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::conflict::resolution::ConflictResolution;
use crate::errors::SinkError;
use crate::operation::{Operation, OperationId, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Structured event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: String,
    pub severity: Severity,
    pub resource_key: Option<String>,
    pub operation_id: Option<OperationId>,
    pub details: serde_json::Value,
    pub risk_score: u8,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, severity: Severity) -> Self {
        Self {
            event_type: event_type.into(),
            severity,
            resource_key: None,
            operation_id: None,
            details: serde_json::Value::Null,
            risk_score: 0,
            timestamp: Utc::now(),
        }
    }

    /// Fills in the resource and operation from `operation`.
    pub fn for_operation(mut self, operation: &Operation) -> Self {
        self.resource_key = Some(operation.resource_key.clone());
        self.operation_id = Some(operation.id.clone());
        self
    }

    pub fn with_resource(mut self, resource_key: impl Into<String>) -> Self {
        self.resource_key = Some(resource_key.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_risk_score(mut self, risk_score: u8) -> Self {
        self.risk_score = risk_score.min(100);
        self
    }
}

/// Event recorded for every lifecycle transition.
pub type AuditEvent = EngineEvent;
/// Event raised for completions and anomalies worth a human look.
pub type SecurityEvent = EngineEvent;

/// Receives audit events. Delivery failures never roll back an operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), SinkError>;
}

/// Receives security events. Delivery failures never roll back an operation.
pub trait SecurityEventSink: Send + Sync {
    fn record(&self, event: &SecurityEvent) -> Result<(), SinkError>;
}

/// Writes every event to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl AuditSink for LoggingSink {
    fn record(&self, event: &AuditEvent) -> Result<(), SinkError> {
        info!(
            "audit {} on {:?} ({:?}): {}",
            event.event_type, event.resource_key, event.operation_id, event.details
        );
        Ok(())
    }
}

impl SecurityEventSink for LoggingSink {
    fn record(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        match event.severity {
            Severity::Info => info!(
                "security {} [{}] risk={} on {:?}",
                event.event_type, event.severity, event.risk_score, event.resource_key
            ),
            _ => warn!(
                "security {} [{}] risk={} on {:?}: {}",
                event.event_type, event.severity, event.risk_score, event.resource_key, event.details
            ),
        }
        Ok(())
    }
}

/// Fans events out to the configured sinks, logging failed deliveries.
#[derive(Clone)]
pub struct EventDispatcher {
    audit: Arc<dyn AuditSink>,
    security: Arc<dyn SecurityEventSink>,
}

impl EventDispatcher {
    pub fn new(audit: Arc<dyn AuditSink>, security: Arc<dyn SecurityEventSink>) -> Self {
        Self { audit, security }
    }

    pub fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event) {
            warn!("Dropped audit event {}: {}", event.event_type, e);
        }
    }

    pub fn security(&self, event: SecurityEvent) {
        if let Err(e) = self.security.record(&event) {
            warn!(
                "Dropped {} security event {}: {}",
                event.severity, event.event_type, e
            );
        }
    }
}

/// Risk score (0-100) of a completed operation.
pub fn risk_score(operation: &Operation, resolution: Option<ConflictResolution>) -> u8 {
    let mut score: u32 = match operation.kind {
        OperationKind::PriceUpdate => 40,
        OperationKind::Adjustment => 30,
        OperationKind::Transfer => 20,
        OperationKind::Reserve => 15,
        _ => 10,
    };
    if operation.conflict_detected {
        score += 20;
    }
    if resolution == Some(ConflictResolution::Override) {
        score += 15;
    }
    score.min(100) as u8
}
