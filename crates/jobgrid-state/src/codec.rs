//! Storage codec for jobs.
//!
//! The only place that knows how a [`Job`] looks on disk. Every field
//! round-trips, including the argument order and the derived durations.

use crate::error::{StateError, StateResult};
use crate::types::Job;

/// Encode a job into its stored byte representation.
pub fn encode_job(job: &Job) -> StateResult<Vec<u8>> {
    serde_json::to_vec(job).map_err(|e| StateError::Serialize(format!("job {}: {e}", job.id)))
}

/// Decode a stored job record.
pub fn decode_job(bytes: &[u8]) -> StateResult<Job> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize(e.to_string()))
}
