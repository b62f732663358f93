//! ServiceRegistry — hosts, services, jobs and the dispatch algorithm.
//!
//! The registry is the single owner of all mutable coordination state:
//!
//! - the host table (`BTreeMap<HostUrl, HostRegistration>`)
//! - the service table: registrations, locally bound producers, and the
//!   per-registration job assignment index used for load accounting
//! - the [`JobStore`]
//!
//! Each collection sits behind its own mutex. Methods that need more than one
//! acquire them in the order hosts → services → jobs and never call into a
//! [`JobProducer`] while holding any of them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, info, warn};

use jobgrid_state::{
    epoch_millis, HostRegistration, HostUrl, Job, JobId, JobStatus, JobStore, NodeLoad,
    ServiceKey, ServiceRegistration, SystemLoad,
};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::identity::{SecurityService, ThreadSecurityService};
use crate::incident::{InMemoryIncidentService, IncidentService, Incidents};
use crate::producer::{JobProducer, Rejection};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ServiceTable {
    registrations: BTreeMap<ServiceKey, ServiceRegistration>,
    producers: HashMap<ServiceKey, Arc<dyn JobProducer>>,
    /// Jobs handed to (or being offered to) each registration.
    assignments: HashMap<ServiceKey, BTreeSet<JobId>>,
    /// Producer registrations already reported as having no local producer.
    unbound_reported: HashSet<ServiceKey>,
}

impl ServiceTable {
    fn unassign(&mut self, id: JobId) {
        for ids in self.assignments.values_mut() {
            ids.remove(&id);
        }
    }

    fn remove_key(&mut self, key: &ServiceKey) -> Option<ServiceRegistration> {
        self.producers.remove(key);
        self.assignments.remove(key);
        self.unbound_reported.remove(key);
        self.registrations.remove(key)
    }
}

/// Which job a new job hangs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentJob {
    /// The job currently executing on the calling thread, if any.
    #[default]
    Current,
    None,
    Id(JobId),
}

/// Everything needed to create a job.
///
/// Defaults: queueable, load 1.0, parented to the current job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub payload: Option<String>,
    pub queueable: bool,
    pub parent: ParentJob,
    pub job_load: f64,
}

impl NewJob {
    pub fn new(job_type: &str, operation: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            operation: operation.to_string(),
            arguments: Vec::new(),
            payload: None,
            queueable: true,
            parent: ParentJob::Current,
            job_load: 1.0,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Create the job `Instantiated`; the dispatcher ignores it until the
    /// caller promotes it to `Queued`.
    pub fn not_queueable(mut self) -> Self {
        self.queueable = false;
        self
    }

    pub fn with_parent(mut self, parent: ParentJob) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_job_load(mut self, job_load: f64) -> Self {
        self.job_load = job_load;
        self
    }
}

/// Result of offering one job to its candidates.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The job was handed to this registration.
    Dispatched(ServiceRegistration),
    /// Nobody accepted; the job is queued again.
    NotDispatched,
    /// The job was no longer queued when the dispatch started.
    Skipped,
}

/// Optional filters for counting jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    pub job_type: Option<String>,
    pub operation: Option<String>,
    /// Matches the job's processing host.
    pub host: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobQuery {
    pub fn job_type(mut self, job_type: &str) -> Self {
        self.job_type = Some(job_type.to_string());
        self
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && self.operation.as_deref().is_none_or(|o| job.operation == o)
            && self
                .host
                .as_deref()
                .is_none_or(|h| job.processing_host.as_deref() == Some(h))
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// The coordinator for hosts, services and jobs.
pub struct ServiceRegistry {
    config: RegistryConfig,
    hosts: Mutex<BTreeMap<HostUrl, HostRegistration>>,
    services: Mutex<ServiceTable>,
    jobs: Mutex<JobStore>,
    last_id: AtomicU64,
    current_jobs: Mutex<HashMap<ThreadId, JobId>>,
    security: Arc<dyn SecurityService>,
    incidents: Incidents,
}

impl ServiceRegistry {
    /// Create a registry over a job store.
    ///
    /// Job ids continue after the highest id already in the store.
    pub fn new(config: RegistryConfig, store: JobStore) -> RegistryResult<Self> {
        let last_id = store.max_job_id()?;
        info!(hostname = %config.hostname, last_id, "service registry started");
        Ok(Self {
            config,
            hosts: Mutex::new(BTreeMap::new()),
            services: Mutex::new(ServiceTable::default()),
            jobs: Mutex::new(store),
            last_id: AtomicU64::new(last_id),
            current_jobs: Mutex::new(HashMap::new()),
            security: Arc::new(ThreadSecurityService::new()),
            incidents: Incidents::new(Arc::new(InMemoryIncidentService::new())),
        })
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityService>) -> Self {
        self.security = security;
        self
    }

    pub fn with_incident_service(mut self, sink: Arc<dyn IncidentService>) -> Self {
        self.incidents = Incidents::new(sink);
        self
    }

    pub fn security(&self) -> &dyn SecurityService {
        self.security.as_ref()
    }

    /// Handle for recording and reading job incidents.
    pub fn incident(&self) -> &Incidents {
        &self.incidents
    }

    /// Host key under which this registry's own node is registered.
    pub fn registry_hostname(&self) -> &str {
        &self.config.hostname
    }

    // ── Hosts ─────────────────────────────────────────────────────

    /// Register a host, or refresh the capacity of a known one.
    ///
    /// A re-registered host comes back online but keeps its active and
    /// maintenance flags.
    pub fn register_host(
        &self,
        base_url: &str,
        address: &str,
        node_name: &str,
        cores: u32,
        memory: u64,
        max_load: f64,
    ) -> RegistryResult<HostRegistration> {
        if base_url.is_empty() {
            return Err(RegistryError::InvalidArgument("host base url is empty".into()));
        }
        if !max_load.is_finite() || max_load < 0.0 {
            return Err(RegistryError::InvalidArgument(format!(
                "max load of {base_url} must be a non-negative number, got {max_load}"
            )));
        }

        let mut hosts = lock(&self.hosts);
        let mut host = HostRegistration::new(base_url, address, node_name, cores, memory, max_load);
        if let Some(existing) = hosts.get(base_url) {
            host.active = existing.active;
            host.maintenance_mode = existing.maintenance_mode;
            debug!(host = %base_url, "host re-registered");
        } else {
            info!(host = %base_url, cores, max_load, "host registered");
        }
        hosts.insert(base_url.to_string(), host.clone());
        Ok(host)
    }

    /// Remove a host together with every service registered on it.
    pub fn unregister_host(&self, base_url: &str) -> RegistryResult<()> {
        let mut hosts = lock(&self.hosts);
        let mut services = lock(&self.services);
        if hosts.remove(base_url).is_none() {
            debug!(host = %base_url, "host not registered, nothing to unregister");
            return Ok(());
        }

        let keys: Vec<ServiceKey> = services
            .registrations
            .keys()
            .filter(|k| k.host == base_url)
            .cloned()
            .collect();
        for key in &keys {
            services.remove_key(key);
        }
        info!(host = %base_url, services_removed = keys.len(), "host unregistered");
        Ok(())
    }

    pub fn enable_host(&self, base_url: &str) -> RegistryResult<()> {
        self.set_host_active(base_url, true)
    }

    pub fn disable_host(&self, base_url: &str) -> RegistryResult<()> {
        self.set_host_active(base_url, false)
    }

    fn set_host_active(&self, base_url: &str, active: bool) -> RegistryResult<()> {
        let mut hosts = lock(&self.hosts);
        let host = hosts
            .get_mut(base_url)
            .ok_or_else(|| RegistryError::NotFound(format!("host {base_url}")))?;
        host.active = active;
        info!(host = %base_url, active, "host activation changed");
        Ok(())
    }

    /// Put a host and every registration on it in or out of maintenance.
    ///
    /// Both tables are locked for the whole update, so no reader sees the
    /// host and its registrations disagree.
    pub fn set_maintenance_status(&self, base_url: &str, maintenance: bool) -> RegistryResult<()> {
        let mut hosts = lock(&self.hosts);
        let mut services = lock(&self.services);
        let host = hosts
            .get_mut(base_url)
            .ok_or_else(|| RegistryError::NotFound(format!("host {base_url}")))?;
        host.maintenance_mode = maintenance;
        for reg in services.registrations.values_mut() {
            if reg.host == base_url {
                reg.maintenance_mode = maintenance;
            }
        }
        info!(host = %base_url, maintenance, "maintenance status changed");
        Ok(())
    }

    pub fn get_host_registration(&self, base_url: &str) -> Option<HostRegistration> {
        lock(&self.hosts).get(base_url).cloned()
    }

    pub fn get_host_registrations(&self) -> Vec<HostRegistration> {
        lock(&self.hosts).values().cloned().collect()
    }

    /// Whether `base_url` is registered, active, online and not in
    /// maintenance.
    pub fn host_accepts_work(&self, base_url: &str) -> bool {
        lock(&self.hosts)
            .get(base_url)
            .is_some_and(HostRegistration::accepts_work)
    }

    // ── Services ──────────────────────────────────────────────────

    /// Register a service on a known host.
    ///
    /// The registration starts online and inherits the host's maintenance
    /// flag. Registering an existing (type, host) pair replaces it.
    pub fn register_service(
        &self,
        service_type: &str,
        host: &str,
        path: &str,
        job_producer: bool,
    ) -> RegistryResult<ServiceRegistration> {
        let hosts = lock(&self.hosts);
        let mut services = lock(&self.services);
        let host_reg = hosts
            .get(host)
            .ok_or_else(|| RegistryError::NotFound(format!("host {host}")))?;

        let mut reg = ServiceRegistration::new(service_type, host, path, job_producer);
        reg.maintenance_mode = host_reg.maintenance_mode;
        let key = reg.key();
        if !job_producer {
            services.producers.remove(&key);
        }
        services.registrations.insert(key, reg.clone());
        info!(service_type = %service_type, %host, %path, job_producer, "service registered");
        Ok(reg)
    }

    /// Register a local producer as a job-producing service on `host`.
    pub fn register_producer(
        &self,
        host: &str,
        path: &str,
        producer: Arc<dyn JobProducer>,
    ) -> RegistryResult<ServiceRegistration> {
        let reg = self.register_service(producer.job_type(), host, path, true)?;
        let mut services = lock(&self.services);
        services.unbound_reported.remove(&reg.key());
        services.producers.insert(reg.key(), producer);
        Ok(reg)
    }

    pub fn unregister_service(&self, service_type: &str, host: &str) -> RegistryResult<()> {
        let key = ServiceKey::new(service_type, host);
        match lock(&self.services).remove_key(&key) {
            Some(_) => info!(service = %key, "service unregistered"),
            None => debug!(service = %key, "service not registered, nothing to unregister"),
        }
        Ok(())
    }

    pub fn get_service_registration(&self, service_type: &str, host: &str) -> Option<ServiceRegistration> {
        lock(&self.services)
            .registrations
            .get(&ServiceKey::new(service_type, host))
            .cloned()
    }

    pub fn get_service_registrations(&self) -> Vec<ServiceRegistration> {
        lock(&self.services).registrations.values().cloned().collect()
    }

    pub fn get_service_registrations_by_type(&self, service_type: &str) -> Vec<ServiceRegistration> {
        lock(&self.services)
            .registrations
            .values()
            .filter(|r| r.service_type == service_type)
            .cloned()
            .collect()
    }

    pub fn get_service_registrations_by_host(&self, host: &str) -> Vec<ServiceRegistration> {
        lock(&self.services)
            .registrations
            .values()
            .filter(|r| r.host == host)
            .cloned()
            .collect()
    }

    /// Every registration of `service_type`, least-loaded host first. Ties
    /// are broken by host URL.
    ///
    /// Registrations that cannot take work right now (maintenance, offline,
    /// or on a disabled host) are included; callers skip them.
    pub fn get_service_registrations_by_load(
        &self,
        service_type: &str,
    ) -> RegistryResult<Vec<ServiceRegistration>> {
        let hosts = lock(&self.hosts);
        let services = lock(&self.services);
        let jobs = lock(&self.jobs);
        let loads = compute_loads(&hosts, &services, &jobs)?;

        let mut candidates: Vec<(NodeLoad, ServiceRegistration)> = services
            .registrations
            .values()
            .filter(|r| r.service_type == service_type)
            .map(|r| {
                let load = loads
                    .get(&r.host)
                    .cloned()
                    .unwrap_or_else(|| NodeLoad::new(&r.host, 0.0, 0.0));
                (load, r.clone())
            })
            .collect();
        candidates.sort_by(|a, b| a.0.rank(&b.0));
        Ok(candidates.into_iter().map(|(_, r)| r).collect())
    }

    // ── Loads ─────────────────────────────────────────────────────

    /// Current load of every registered host.
    pub fn get_current_host_loads(&self) -> RegistryResult<SystemLoad> {
        let hosts = lock(&self.hosts);
        let services = lock(&self.services);
        let jobs = lock(&self.jobs);
        compute_loads(&hosts, &services, &jobs)
    }

    /// Capacity of every registered host, with current load left at zero.
    pub fn get_max_loads(&self) -> SystemLoad {
        let mut loads = SystemLoad::new();
        for host in lock(&self.hosts).values() {
            loads.add_node_load(NodeLoad::new(&host.base_url, 0.0, host.max_load));
        }
        loads
    }

    pub fn get_max_load_on_node(&self, host: &str) -> RegistryResult<NodeLoad> {
        lock(&self.hosts)
            .get(host)
            .map(|h| NodeLoad::new(&h.base_url, 0.0, h.max_load))
            .ok_or_else(|| RegistryError::NotFound(format!("host {host}")))
    }

    /// Current load of the registry's own host, zero if it is not registered.
    pub fn own_load(&self) -> RegistryResult<f64> {
        let loads = self.get_current_host_loads()?;
        Ok(loads
            .get(&self.config.hostname)
            .map(|l| l.current_load)
            .unwrap_or(0.0))
    }

    // ── Jobs ──────────────────────────────────────────────────────

    /// Create a queued job with default load under the current job.
    pub fn create_job(&self, job_type: &str, operation: &str) -> RegistryResult<Job> {
        self.create(NewJob::new(job_type, operation))
    }

    pub fn create_job_with_arguments(
        &self,
        job_type: &str,
        operation: &str,
        arguments: Vec<String>,
        payload: Option<&str>,
    ) -> RegistryResult<Job> {
        let mut new_job = NewJob::new(job_type, operation).with_arguments(arguments);
        new_job.payload = payload.map(str::to_string);
        self.create(new_job)
    }

    /// Create a job from a full description.
    ///
    /// Creator and organization come from the security service. A child's
    /// root is its parent's root, or the parent itself when the parent is a
    /// root.
    pub fn create(&self, new_job: NewJob) -> RegistryResult<Job> {
        if new_job.job_type.is_empty() {
            return Err(RegistryError::InvalidArgument("job type is empty".into()));
        }
        if !new_job.job_load.is_finite() || new_job.job_load <= 0.0 {
            return Err(RegistryError::InvalidArgument(format!(
                "job load must be positive, got {}",
                new_job.job_load
            )));
        }
        let parent_id = match new_job.parent {
            ParentJob::Current => self.current_job(),
            ParentJob::None => None,
            ParentJob::Id(id) => Some(id),
        };

        let jobs = lock(&self.jobs);
        let root_id = match parent_id {
            Some(pid) => {
                let parent = jobs
                    .get_job(pid)?
                    .ok_or_else(|| RegistryError::NotFound(format!("parent job {pid}")))?;
                Some(parent.root_job_id.unwrap_or(parent.id))
            }
            None => None,
        };

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut job = Job::new(id, &new_job.job_type, &new_job.operation);
        job.arguments = new_job.arguments;
        job.payload = new_job.payload;
        job.status = if new_job.queueable {
            JobStatus::Queued
        } else {
            JobStatus::Instantiated
        };
        job.date_created = Some(epoch_millis());
        job.parent_job_id = parent_id;
        job.root_job_id = root_id;
        job.creator = self.security.user();
        job.organization = self.security.organization();
        job.job_load = new_job.job_load;

        jobs.put_job(&job)?;
        debug!(job_id = id, job_type = %job.job_type, operation = %job.operation, status = %job.status, "job created");
        Ok(job)
    }

    /// Persist a job snapshot.
    ///
    /// The status change must follow the job lifecycle. Entering `Running`
    /// stamps the start time and queue time; entering `Finished` or `Failed`
    /// stamps completion and run time. The job counts against the load of
    /// its current processing host only; terminal jobs count nowhere.
    pub fn update_job(&self, job: &Job) -> RegistryResult<Job> {
        let mut services = lock(&self.services);
        let jobs = lock(&self.jobs);
        let updated = apply_update(&jobs, job.clone())?;

        services.unassign(updated.id);
        if let Some(host) = updated.processing_host.as_deref().filter(|_| !updated.status.is_terminal()) {
            let key = ServiceKey::new(&updated.job_type, host);
            if services.registrations.contains_key(&key) {
                services.assignments.entry(key).or_default().insert(updated.id);
            }
        }
        Ok(updated)
    }

    pub fn get_job(&self, id: JobId) -> RegistryResult<Job> {
        lock(&self.jobs)
            .get_job(id)?
            .ok_or_else(|| RegistryError::NotFound(format!("job {id}")))
    }

    /// Jobs filtered by type and status, in id order.
    pub fn get_jobs(&self, job_type: Option<&str>, status: Option<JobStatus>) -> RegistryResult<Vec<Job>> {
        Ok(lock(&self.jobs).scan(|j| {
            job_type.is_none_or(|t| j.job_type == t) && status.is_none_or(|s| j.status == s)
        })?)
    }

    /// Queued, dispatching and running jobs.
    pub fn get_active_jobs(&self) -> RegistryResult<Vec<Job>> {
        Ok(lock(&self.jobs).scan(|j| j.status.is_active())?)
    }

    /// Every descendant of a job, ordered by creation time.
    pub fn get_child_jobs(&self, id: JobId) -> RegistryResult<Vec<Job>> {
        let all = lock(&self.jobs).list_jobs()?;
        let mut by_parent: HashMap<JobId, Vec<&Job>> = HashMap::new();
        for job in &all {
            if let Some(pid) = job.parent_job_id {
                by_parent.entry(pid).or_default().push(job);
            }
        }

        let mut children = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(pid) = queue.pop_front() {
            for child in by_parent.get(&pid).into_iter().flatten() {
                queue.push_back(child.id);
                children.push((*child).clone());
            }
        }
        children.sort_by_key(|j| (j.date_created, j.id));
        Ok(children)
    }

    /// Payloads of all jobs running `operation`.
    pub fn get_job_payloads(&self, operation: &str) -> RegistryResult<Vec<String>> {
        let jobs = lock(&self.jobs).scan(|j| j.operation == operation)?;
        Ok(jobs.into_iter().filter_map(|j| j.payload).collect())
    }

    /// Delete jobs by id. Fails without deleting anything if an id is unknown.
    pub fn remove_jobs(&self, ids: &[JobId]) -> RegistryResult<()> {
        let mut services = lock(&self.services);
        let jobs = lock(&self.jobs);
        for id in ids {
            if !jobs.contains(*id)? {
                return Err(RegistryError::NotFound(format!("job {id}")));
            }
        }
        let removed = jobs.delete_jobs(ids)?;
        for id in ids {
            services.unassign(*id);
        }
        info!(removed, "jobs removed");
        Ok(())
    }

    /// Delete every job without a parent.
    ///
    /// `lifetime_days` is accepted for compatibility but not applied: jobs are
    /// removed regardless of age.
    pub fn remove_parentless_jobs(&self, lifetime_days: u32) -> RegistryResult<u32> {
        let mut services = lock(&self.services);
        let jobs = lock(&self.jobs);
        let ids: Vec<JobId> = jobs.scan(Job::is_parentless)?.iter().map(|j| j.id).collect();
        let removed = jobs.delete_jobs(&ids)?;
        for id in &ids {
            services.unassign(*id);
        }
        info!(removed, lifetime_days, "parentless jobs removed (age not considered)");
        Ok(removed)
    }

    /// Mark `id` as the job executing on the calling thread.
    pub fn set_current_job(&self, id: Option<JobId>) {
        let mut current = lock(&self.current_jobs);
        let thread = thread::current().id();
        match id {
            Some(id) => current.insert(thread, id),
            None => current.remove(&thread),
        };
    }

    pub fn current_job(&self) -> Option<JobId> {
        lock(&self.current_jobs).get(&thread::current().id()).copied()
    }

    // ── Counts ────────────────────────────────────────────────────

    pub fn count(&self, query: &JobQuery) -> RegistryResult<u64> {
        Ok(lock(&self.jobs).scan(|j| query.matches(j))?.len() as u64)
    }

    pub fn count_by_host(&self, job_type: &str, host: &str, status: JobStatus) -> RegistryResult<u64> {
        self.count(&JobQuery::default().job_type(job_type).host(host).status(status))
    }

    pub fn count_by_operation(&self, job_type: &str, operation: &str, status: JobStatus) -> RegistryResult<u64> {
        self.count(
            &JobQuery::default()
                .job_type(job_type)
                .operation(operation)
                .status(status),
        )
    }

    /// Number of jobs in each status. Statuses without jobs are omitted.
    pub fn count_by_status(&self) -> RegistryResult<BTreeMap<JobStatus, u64>> {
        let mut counts = BTreeMap::new();
        for job in lock(&self.jobs).list_jobs()? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    // ── Dispatch ──────────────────────────────────────────────────

    /// Offer a queued job to the registrations of its type.
    ///
    /// The job is claimed (`Dispatching`) before any candidate is contacted.
    /// Candidates are tried least-loaded first. Skipped are registrations in
    /// maintenance or offline, those on a disabled or offline host,
    /// informational ones and those without a local producer; a job whose
    /// candidates are all skipped goes back to the queue. The first producer
    /// to pass both admission checks gets the job, exactly once.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ServiceUnavailable`] when no registration of the
    ///   job's type exists; the job has been failed.
    /// - [`RegistryError::Undispatchable`] when the accepting producer
    ///   rejected the job; the job has been failed.
    /// - Any other error leaves the job queued for the next attempt.
    pub fn dispatch_job(&self, id: JobId) -> RegistryResult<DispatchOutcome> {
        self.dispatch(id, None)
    }

    /// Like [`dispatch_job`](Self::dispatch_job), but hosts without room for
    /// the job in `loads` are passed over.
    pub fn dispatch_job_with_capacity(&self, id: JobId, loads: &SystemLoad) -> RegistryResult<DispatchOutcome> {
        self.dispatch(id, Some(loads))
    }

    fn dispatch(&self, id: JobId, capacity: Option<&SystemLoad>) -> RegistryResult<DispatchOutcome> {
        let Some(mut job) = self.claim(id)? else {
            return Ok(DispatchOutcome::Skipped);
        };

        match self.offer(&mut job, capacity) {
            Ok(Some(reg)) => Ok(DispatchOutcome::Dispatched(reg)),
            Ok(None) => {
                job.status = JobStatus::Queued;
                job.processing_host = None;
                self.update_job(&job)?;
                debug!(job_id = id, "no candidate accepted the job, requeued");
                Ok(DispatchOutcome::NotDispatched)
            }
            Err(err @ (RegistryError::ServiceUnavailable(_) | RegistryError::Undispatchable { .. })) => {
                job.status = JobStatus::Failed;
                self.update_job(&job)?;
                Err(err)
            }
            Err(err) => {
                self.release(job.id);
                Err(err)
            }
        }
    }

    /// Move a queued job to `Dispatching`, or return `None` if it is no
    /// longer queued.
    fn claim(&self, id: JobId) -> RegistryResult<Option<Job>> {
        let jobs = lock(&self.jobs);
        let mut job = jobs
            .get_job(id)?
            .ok_or_else(|| RegistryError::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::Queued {
            debug!(job_id = id, status = %job.status, "job no longer queued, skipping");
            return Ok(None);
        }
        job.status = JobStatus::Dispatching;
        jobs.put_job(&job)?;
        Ok(Some(job))
    }

    /// Best-effort return of a claimed job to the queue after an error.
    ///
    /// Does nothing unless the job is still `Dispatching`.
    pub(crate) fn release(&self, id: JobId) {
        let mut services = lock(&self.services);
        services.unassign(id);
        let jobs = lock(&self.jobs);
        let mut job = match jobs.get_job(id) {
            Ok(Some(job)) if job.status == JobStatus::Dispatching => job,
            Ok(_) => return,
            Err(e) => {
                warn!(job_id = id, error = %e, "failed to read job while requeueing it");
                return;
            }
        };
        job.status = JobStatus::Queued;
        job.processing_host = None;
        match jobs.put_job(&job) {
            Ok(()) => debug!(job_id = id, "claimed job returned to the queue"),
            Err(e) => warn!(job_id = id, error = %e, "failed to requeue job after dispatch error"),
        }
    }

    fn offer(&self, job: &mut Job, capacity: Option<&SystemLoad>) -> RegistryResult<Option<ServiceRegistration>> {
        let candidates = self.get_service_registrations_by_load(&job.job_type)?;
        if candidates.is_empty() {
            return Err(RegistryError::ServiceUnavailable(job.job_type.clone()));
        }

        for reg in candidates {
            let key = reg.key();
            if reg.maintenance_mode {
                debug!(job_id = job.id, service = %key, "candidate in maintenance, skipping");
                continue;
            }
            if !reg.online || !self.host_accepts_work(&reg.host) {
                debug!(job_id = job.id, service = %key, "candidate host not available, skipping");
                continue;
            }
            if !reg.job_producer {
                debug!(job_id = job.id, service = %key, "candidate is not a job producer, skipping");
                continue;
            }
            if let Some(load) = capacity.and_then(|loads| loads.get(&reg.host)) {
                if !load.has_capacity_for(job.job_load) {
                    debug!(
                        job_id = job.id,
                        service = %key,
                        current_load = load.current_load,
                        max_load = load.max_load,
                        "candidate host is full, skipping"
                    );
                    continue;
                }
            }
            let Some(producer) = self.tentatively_assign(&key, job.id) else {
                self.report_unbound(&key, job.id);
                continue;
            };

            if !producer.is_ready_to_accept_jobs(&job.operation) || !producer.is_ready_to_accept(job) {
                debug!(job_id = job.id, service = %key, "candidate declined");
                lock(&self.services).unassign(job.id);
                continue;
            }

            job.processing_host = Some(reg.host.clone());
            lock(&self.jobs).put_job(job)?;

            match producer.accept_job(job) {
                Ok(()) => {
                    info!(job_id = job.id, service = %key, "job dispatched");
                    return Ok(Some(reg));
                }
                Err(Rejection(reason)) => {
                    lock(&self.services).unassign(job.id);
                    let service = key.to_string();
                    self.incidents.failure(
                        job,
                        "dispatch.rejected",
                        &[("service", service.as_str()), ("reason", reason.as_str())],
                    );
                    return Err(RegistryError::Undispatchable {
                        job_id: job.id,
                        reason,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Warn once per registration that claims to produce jobs but has no
    /// local producer bound.
    fn report_unbound(&self, key: &ServiceKey, id: JobId) {
        if lock(&self.services).unbound_reported.insert(key.clone()) {
            warn!(job_id = id, service = %key, "no local producer bound, remote dispatch unsupported");
        } else {
            debug!(job_id = id, service = %key, "no local producer bound, skipping");
        }
    }

    /// Record `id` against a registration's assignments and return its bound
    /// producer, or `None` when no producer is bound.
    fn tentatively_assign(&self, key: &ServiceKey, id: JobId) -> Option<Arc<dyn JobProducer>> {
        let mut services = lock(&self.services);
        let producer = services.producers.get(key).cloned()?;
        services.assignments.entry(key.clone()).or_default().insert(id);
        Some(producer)
    }
}

/// Sum the load of influencing jobs per host.
fn compute_loads(
    hosts: &BTreeMap<HostUrl, HostRegistration>,
    services: &ServiceTable,
    store: &JobStore,
) -> RegistryResult<SystemLoad> {
    let mut loads = SystemLoad::new();
    for host in hosts.values() {
        loads.add_node_load(NodeLoad::new(&host.base_url, 0.0, host.max_load));
    }
    for (key, ids) in &services.assignments {
        let counts = services
            .registrations
            .get(key)
            .is_some_and(|r| r.online && !r.maintenance_mode);
        if !counts {
            continue;
        }
        for id in ids {
            if let Some(job) = store.get_job(*id)? {
                if job.status.influences_load() {
                    loads.update_node_load(&key.host, job.job_load);
                }
            }
        }
    }
    Ok(loads)
}

/// Validate a status change against the stored job and derive timestamps.
fn apply_update(store: &JobStore, mut job: Job) -> RegistryResult<Job> {
    let stored = store
        .get_job(job.id)?
        .ok_or_else(|| RegistryError::NotFound(format!("job {}", job.id)))?;
    if !stored.status.can_transition_to(job.status) {
        return Err(RegistryError::InvalidTransition {
            job_id: job.id,
            from: stored.status,
            to: job.status,
        });
    }
    if stored.date_created.is_some() {
        job.date_created = stored.date_created;
    }

    if stored.status != job.status {
        let now = epoch_millis();
        match job.status {
            JobStatus::Running => {
                if job.date_started.is_none() {
                    job.date_started = Some(now);
                    job.queue_time = job.date_created.map(|c| now.saturating_sub(c));
                }
            }
            JobStatus::Finished => {
                if job.date_started.is_none() {
                    job.date_started = job.date_created;
                    job.queue_time = Some(0);
                }
                if job.date_completed.is_none() {
                    job.date_completed = Some(now);
                    job.run_time = job.date_started.map(|s| now.saturating_sub(s));
                }
            }
            JobStatus::Failed => {
                if job.date_completed.is_none() {
                    job.date_completed = Some(now);
                    job.run_time = job.date_started.map(|s| now.saturating_sub(s));
                }
            }
            _ => {}
        }
        debug!(job_id = job.id, from = %stored.status, to = %job.status, "job status changed");
    }

    store.put_job(&job)?;
    Ok(job)
}
