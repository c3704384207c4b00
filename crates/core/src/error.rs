use crate::job::JobStatus;
use crate::types::JobId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Job {id} violates an invariant: {reason}")]
    InvalidJob { id: JobId, reason: String },

    #[error("Illegal status transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Validation failed: {0}")]
    Validation(String),
}
