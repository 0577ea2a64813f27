use thiserror::Error;

use crate::core::models::JobStatus;
use crate::core::provisioning::ProvisioningError;

/// Errors surfaced synchronously by orchestrator operations.
///
/// Failures that happen inside a background job are never returned through
/// this type to the original caller; they are recorded on the job instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),
    /// Cancel requested for a job outside Pending, Running or PlanningCompleted.
    #[error("Validation error: Cannot cancel a job in status {status}")]
    CannotCancel { job_id: String, status: JobStatus },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("Storage error: {0}")]
    Store(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Precondition failures, including rejected cancels.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::CannotCancel { .. })
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
