use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, warn};

use crate::errors::{OperationError, Result};
use crate::operation::OperationSummary;

/// Answer from an approval provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved { approver: String },
    Denied { reason: String },
    /// The provider gave up waiting on its own.
    TimedOut,
}

/// External workflow asked to sign off on sensitive operations.
pub trait ApprovalProvider: Send + Sync {
    fn request_approval<'a>(
        &'a self,
        operation: &'a OperationSummary,
    ) -> BoxFuture<'a, ApprovalDecision>;
}

/// Approves everything immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl ApprovalProvider for AutoApprove {
    fn request_approval<'a>(
        &'a self,
        _operation: &'a OperationSummary,
    ) -> BoxFuture<'a, ApprovalDecision> {
        async {
            ApprovalDecision::Approved {
                approver: "auto".to_string(),
            }
        }
        .boxed()
    }
}

/// Bounds an [`ApprovalProvider`] by a timeout and maps its answer to an
/// operation result.
#[derive(Clone)]
pub struct ApprovalGate {
    provider: Arc<dyn ApprovalProvider>,
}

impl ApprovalGate {
    pub fn new(provider: Arc<dyn ApprovalProvider>) -> Self {
        Self { provider }
    }

    /// Waits for a decision. Returns the approver on success.
    pub async fn request(&self, operation: &OperationSummary, timeout: Duration) -> Result<String> {
        debug!("Requesting approval for {} on {}", operation.id, operation.resource_key);
        match tokio::time::timeout(timeout, self.provider.request_approval(operation)).await {
            Ok(ApprovalDecision::Approved { approver }) => Ok(approver),
            Ok(ApprovalDecision::Denied { reason }) => {
                warn!("Approval for {} denied: {}", operation.id, reason);
                Err(OperationError::ApprovalDenied { reason })
            }
            Ok(ApprovalDecision::TimedOut) | Err(_) => {
                warn!("Approval for {} timed out after {:?}", operation.id, timeout);
                Err(OperationError::ApprovalTimeout)
            }
        }
    }
}
