//! Domain types for jobgrid.
//!
//! These are plain data records: jobs and their lifecycle status, host and
//! service registrations. Derived serde impls exist so the [`codec`] module
//! can persist them, but nothing here performs I/O.
//!
//! [`codec`]: crate::codec

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique, monotonically assigned job identifier.
pub type JobId = u64;

/// Base URL identifying a host in the cluster (e.g. `http://10.0.0.1:8080`).
pub type HostUrl = String;

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Instantiated,
    Queued,
    Dispatching,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Instantiated,
        JobStatus::Queued,
        JobStatus::Dispatching,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
    ];

    /// Queued, dispatching or running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Dispatching | JobStatus::Running
        )
    }

    /// Finished or failed. Terminal jobs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Whether a job in this status counts against its host's load.
    pub fn influences_load(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Keeping the same status is always legal for non-terminal jobs so that
    /// callers can persist payload or argument changes. Instantiated jobs may
    /// complete directly; producers that run work inline never queue it.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        match self {
            Instantiated => matches!(next, Queued | Finished | Failed),
            Queued => matches!(next, Dispatching | Failed),
            Dispatching => matches!(next, Queued | Running | Failed),
            Running => matches!(next, Finished | Failed),
            Finished | Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Instantiated => "instantiated",
            JobStatus::Queued => "queued",
            JobStatus::Dispatching => "dispatching",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous work tracked through its lifecycle.
///
/// Timestamps are Unix epoch milliseconds. `queue_time` and `run_time` are
/// derived by the registry when the job is updated and are never set by
/// callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Names the capability (service type) required to process this job.
    pub job_type: String,
    /// Capability-specific verb.
    pub operation: String,
    pub arguments: Vec<String>,
    pub payload: Option<String>,
    pub status: JobStatus,
    pub date_created: Option<u64>,
    pub date_started: Option<u64>,
    pub date_completed: Option<u64>,
    /// Milliseconds between creation and start.
    pub queue_time: Option<u64>,
    /// Milliseconds between start and completion.
    pub run_time: Option<u64>,
    pub parent_job_id: Option<JobId>,
    pub root_job_id: Option<JobId>,
    pub creator: Option<String>,
    pub organization: Option<String>,
    /// Approximate number of cores this job keeps busy.
    pub job_load: f64,
    pub processing_host: Option<HostUrl>,
}

impl Job {
    /// A fresh queued job with default load and no lineage.
    pub fn new(id: JobId, job_type: &str, operation: &str) -> Self {
        Self {
            id,
            job_type: job_type.to_string(),
            operation: operation.to_string(),
            arguments: Vec::new(),
            payload: None,
            status: JobStatus::Queued,
            date_created: None,
            date_started: None,
            date_completed: None,
            queue_time: None,
            run_time: None,
            parent_job_id: None,
            root_job_id: None,
            creator: None,
            organization: None,
            job_load: 1.0,
            processing_host: None,
        }
    }

    /// `type@operation`, used to group jobs that dispatch identically.
    pub fn signature(&self) -> String {
        format!("{}@{}", self.job_type, self.operation)
    }

    /// True when the job has no parent (a null or non-positive parent id).
    pub fn is_parentless(&self) -> bool {
        self.parent_job_id.is_none_or(|id| id == 0)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} ({}:{})", self.id, self.job_type, self.operation)
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// A cluster node's capacity and administrative flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRegistration {
    pub base_url: HostUrl,
    pub address: String,
    pub node_name: String,
    pub cores: u32,
    /// Memory in bytes.
    pub memory: u64,
    /// Load this host can carry, in core-equivalents.
    pub max_load: f64,
    pub online: bool,
    pub active: bool,
    pub maintenance_mode: bool,
}

impl HostRegistration {
    pub fn new(base_url: &str, address: &str, node_name: &str, cores: u32, memory: u64, max_load: f64) -> Self {
        Self {
            base_url: base_url.to_string(),
            address: address.to_string(),
            node_name: node_name.to_string(),
            cores,
            memory,
            max_load,
            online: true,
            active: true,
            maintenance_mode: false,
        }
    }

    /// Active, online and not under maintenance.
    pub fn accepts_work(&self) -> bool {
        self.active && self.online && !self.maintenance_mode
    }
}

// ── Service ───────────────────────────────────────────────────────

/// Composite key of a service registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_type: String,
    pub host: HostUrl,
}

impl ServiceKey {
    pub fn new(service_type: &str, host: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            host: host.to_string(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_type, self.host)
    }
}

/// Where a capability is reachable and whether it accepts jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRegistration {
    pub service_type: String,
    pub host: HostUrl,
    /// Path under the host's base URL, e.g. `/ingest`.
    pub path: String,
    pub job_producer: bool,
    pub online: bool,
    pub maintenance_mode: bool,
}

impl ServiceRegistration {
    pub fn new(service_type: &str, host: &str, path: &str, job_producer: bool) -> Self {
        Self {
            service_type: service_type.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            job_producer,
            online: true,
            maintenance_mode: false,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.service_type, &self.host)
    }

    /// Full URL of this service: host base URL followed by the path.
    pub fn url(&self) -> String {
        format!("{}{}", self.host, self.path)
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
