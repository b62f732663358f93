//! Job incidents.
//!
//! An append-only record of noteworthy events per job (dispatch failures,
//! producer rejections). Storage is pluggable through [`IncidentService`];
//! the registry hands out an [`Incidents`] handle via
//! [`ServiceRegistry::incident`](crate::ServiceRegistry::incident).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use jobgrid_state::{epoch_millis, Job, JobId};

/// Severity of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub job_id: JobId,
    pub severity: Severity,
    /// Machine-readable code, e.g. `dispatch.no_service`.
    pub code: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub details: BTreeMap<String, String>,
}

/// Sink that stores incidents.
pub trait IncidentService: Send + Sync {
    fn store(&self, incident: Incident);
    fn incidents_for(&self, job_id: JobId) -> Vec<Incident>;
}

/// Incident sink kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryIncidentService {
    incidents: Mutex<HashMap<JobId, Vec<Incident>>>,
}

impl InMemoryIncidentService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IncidentService for InMemoryIncidentService {
    fn store(&self, incident: Incident) {
        let mut map = self.incidents.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(incident.job_id).or_default().push(incident);
    }

    fn incidents_for(&self, job_id: JobId) -> Vec<Incident> {
        let map = self.incidents.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&job_id).cloned().unwrap_or_default()
    }
}

/// Handle for recording and reading job incidents.
#[derive(Clone)]
pub struct Incidents {
    sink: Arc<dyn IncidentService>,
}

impl Incidents {
    pub fn new(sink: Arc<dyn IncidentService>) -> Self {
        Self { sink }
    }

    pub fn record(&self, job: &Job, severity: Severity, code: &str, details: &[(&str, &str)]) {
        debug!(job_id = job.id, ?severity, %code, "recording incident");
        self.sink.store(Incident {
            job_id: job.id,
            severity,
            code: code.to_string(),
            timestamp: epoch_millis(),
            details: details
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    pub fn failure(&self, job: &Job, code: &str, details: &[(&str, &str)]) {
        self.record(job, Severity::Failure, code, details);
    }

    pub fn warning(&self, job: &Job, code: &str, details: &[(&str, &str)]) {
        self.record(job, Severity::Warning, code, details);
    }

    pub fn info(&self, job: &Job, code: &str, details: &[(&str, &str)]) {
        self.record(job, Severity::Info, code, details);
    }

    /// All incidents recorded for a job, oldest first.
    pub fn for_job(&self, job_id: JobId) -> Vec<Incident> {
        self.sink.incidents_for(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_kept_per_job() {
        let incidents = Incidents::new(Arc::new(InMemoryIncidentService::new()));
        let a = Job::new(1, "ingest", "encode");
        let b = Job::new(2, "ingest", "encode");

        incidents.failure(&a, "dispatch.no_service", &[("type", "ingest")]);
        incidents.info(&a, "dispatch.retry", &[]);
        incidents.warning(&b, "producer.slow", &[]);

        let for_a = incidents.for_job(1);
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].severity, Severity::Failure);
        assert_eq!(for_a[0].details.get("type").map(String::as_str), Some("ingest"));
        assert_eq!(for_a[1].code, "dispatch.retry");
        assert_eq!(incidents.for_job(2).len(), 1);
        assert!(incidents.for_job(3).is_empty());
    }
}
