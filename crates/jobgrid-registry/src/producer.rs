//! The capability a service implements to receive dispatched jobs.

use jobgrid_state::Job;

/// Reason a producer gave for refusing a job outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(pub String);

/// A service that can accept and execute jobs of one type.
///
/// Admission is two-phase. The dispatcher first asks whether the producer
/// takes work for an operation at all, then whether it takes this particular
/// job. Only when both answer `true` is [`accept_job`](Self::accept_job)
/// called, exactly once. The producer is then responsible for moving the
/// job to `Running` and on to `Finished` or `Failed` through
/// [`ServiceRegistry::update_job`](crate::ServiceRegistry::update_job).
///
/// Implementations must not hold locks that the registry might need while
/// answering; the registry calls these methods without holding its own.
pub trait JobProducer: Send + Sync {
    /// The service type this producer handles.
    fn job_type(&self) -> &str;

    /// Whether the producer currently accepts jobs for `operation`.
    fn is_ready_to_accept_jobs(&self, operation: &str) -> bool;

    /// Whether the producer accepts this specific job.
    fn is_ready_to_accept(&self, job: &Job) -> bool;

    /// Take ownership of a job.
    ///
    /// Returning a [`Rejection`] marks the job undispatchable: it is failed
    /// rather than put back in the queue.
    fn accept_job(&self, job: &Job) -> Result<(), Rejection>;
}
