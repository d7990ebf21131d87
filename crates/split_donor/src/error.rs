//! Error taxonomy for split donor operations.
//!
//! Transition-level errors are returned to the administrative caller and are
//! never retried internally. Tenant-traffic errors are returned to the command
//! dispatcher for immediate surfacing to the end client.

use crate::document::{OperationId, SplitState, TenantId};

/// Result alias used across the donor library.
pub type DonorResult<T> = Result<T, DonorError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DonorError {
    /// A requested tenant is already enrolled in another non-terminal operation.
    #[error("tenant {tenant_id} is already enrolled in split operation {operation_id}")]
    ConflictingOperation {
        tenant_id: TenantId,
        operation_id: OperationId,
    },

    /// A transition was attempted from a state that forbids it.
    #[error("split operation {operation_id} cannot {action} from state {state}")]
    InvalidState {
        operation_id: OperationId,
        state: SplitState,
        action: &'static str,
    },

    /// The durable store was unavailable or rejected the write. The operation
    /// remains in its prior state.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A persisted record violates the operation invariants.
    #[error("integrity violation for {subject}: {detail}")]
    IntegrityViolation { subject: String, detail: String },

    /// The tenant's data has moved; terminal and non-retryable.
    #[error("tenant {tenant_id} has been migrated by split operation {operation_id}")]
    TenantMigrated {
        tenant_id: TenantId,
        operation_id: OperationId,
    },

    /// A caller-supplied deadline elapsed before the awaited event.
    #[error("timed out after {waited_ms}ms waiting for {what}")]
    OperationTimedOut { what: String, waited_ms: u64 },

    #[error("split operation {0} not found")]
    OperationNotFound(OperationId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DonorError {
    pub fn invalid_state(operation_id: OperationId, state: SplitState, action: &'static str) -> Self {
        Self::InvalidState {
            operation_id,
            state,
            action,
        }
    }

    pub fn integrity(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::PersistenceFailure(err.to_string())
    }

    /// Stable wire code used by the admin surface (`-<CODE> message`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConflictingOperation { .. } => "CONFLICTINGOPERATION",
            Self::InvalidState { .. } => "INVALIDSTATE",
            Self::PersistenceFailure(_) => "PERSISTENCEFAILURE",
            Self::IntegrityViolation { .. } => "INTEGRITYVIOLATION",
            Self::TenantMigrated { .. } => "TENANTMIGRATED",
            Self::OperationTimedOut { .. } => "OPERATIONTIMEDOUT",
            Self::OperationNotFound(_) => "NOSUCHOPERATION",
            Self::InvalidRequest(_) => "BADVALUE",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PersistenceFailure(_) | Self::OperationTimedOut { .. }
        )
    }
}
