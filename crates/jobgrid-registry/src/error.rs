//! Registry error types.

use thiserror::Error;

use jobgrid_state::{JobStatus, StateError};

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing store could not be reached or failed mid-operation.
    #[error("registry communication error: {0}")]
    Communication(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No service registration exists for a job's type.
    #[error("no service available to handle jobs of type '{0}'")]
    ServiceUnavailable(String),

    /// A producer refused a job in a way that must not be retried.
    #[error("job {job_id} cannot be dispatched: {reason}")]
    Undispatchable { job_id: u64, reason: String },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored job could not be encoded or decoded.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl From<StateError> for RegistryError {
    fn from(err: StateError) -> Self {
        if err.is_codec() {
            RegistryError::Corrupt(err.to_string())
        } else {
            RegistryError::Communication(err.to_string())
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
