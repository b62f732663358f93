//! JobDispatcher — background task that places queued jobs.
//!
//! Every cycle scans the queued jobs and runs the registry's dispatch
//! algorithm for each under the identity that created it. The loop is
//! fixed-delay: the interval is measured from the end of one cycle to the
//! start of the next. A cycle runs on the blocking pool because producers are
//! called synchronously.

use std::any::Any;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobgrid_state::{Job, JobStatus, SystemLoad};

use crate::config::DispatcherConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::identity::IdentityScope;
use crate::registry::{DispatchOutcome, ServiceRegistry};

/// Incident code recorded when a job fails because nothing offers its type.
pub const NO_SERVICE_INCIDENT: &str = "dispatch.no_service";

/// What one dispatch cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub scanned: usize,
    pub dispatched: usize,
    /// Offered to every candidate and put back in the queue.
    pub requeued: usize,
    pub failed: usize,
    /// Not attempted: already claimed elsewhere, or the same type and
    /// operation found no taker earlier in this cycle.
    pub skipped: usize,
    /// Left in place after an unexpected error, or returned to the queue
    /// after a producer panicked.
    pub errors: usize,
    /// Host loads at the start of the cycle plus everything dispatched since.
    pub loads: SystemLoad,
}

/// Runs dispatch cycles against a registry.
#[derive(Clone)]
pub struct JobDispatcher {
    registry: Arc<ServiceRegistry>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Run one dispatch cycle.
    ///
    /// Failures of a single job are logged and counted; the scan continues,
    /// also when a producer panics. Only a corrupt job record or a failure to
    /// read the queue aborts the cycle.
    ///
    /// Root jobs, and children of a parent that already has a running child,
    /// only go to hosts with room left in the cycle's load snapshot.
    pub fn run_cycle(&self) -> RegistryResult<CycleReport> {
        let queued = self.registry.get_jobs(None, Some(JobStatus::Queued))?;
        let mut report = CycleReport {
            loads: self.registry.get_current_host_loads()?,
            ..CycleReport::default()
        };
        let mut undispatchable: HashSet<String> = HashSet::new();

        for job in queued {
            report.scanned += 1;
            let signature = job.signature();
            if undispatchable.contains(&signature) {
                report.skipped += 1;
                continue;
            }

            let _scope = IdentityScope::enter(
                self.registry.security(),
                job.creator.clone(),
                job.organization.clone(),
            );
            let capacity_only = self.needs_capacity(&job);
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                if capacity_only {
                    self.registry.dispatch_job_with_capacity(job.id, &report.loads)
                } else {
                    self.registry.dispatch_job(job.id)
                }
            }));
            let result = match attempt {
                Ok(result) => result,
                Err(payload) => {
                    report.errors += 1;
                    self.registry.release(job.id);
                    error!(
                        job_id = job.id,
                        panic = panic_message(payload.as_ref()),
                        "producer panicked during dispatch, job requeued"
                    );
                    continue;
                }
            };

            match result {
                Ok(DispatchOutcome::Dispatched(reg)) => {
                    report.dispatched += 1;
                    report.loads.update_node_load(&reg.host, job.job_load);
                    debug!(
                        job_id = job.id,
                        host = %reg.host,
                        load_factor = report.loads.load_factor(&reg.host).unwrap_or_default(),
                        "job placed"
                    );
                }
                Ok(DispatchOutcome::NotDispatched) => {
                    report.requeued += 1;
                    undispatchable.insert(signature);
                }
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Err(RegistryError::ServiceUnavailable(job_type)) => {
                    report.failed += 1;
                    self.registry.incident().failure(
                        &job,
                        NO_SERVICE_INCIDENT,
                        &[("job_type", job_type.as_str())],
                    );
                    error!(job_id = job.id, %job_type, "no service available, job failed");
                }
                Err(RegistryError::Undispatchable { job_id, reason }) => {
                    report.failed += 1;
                    warn!(job_id, %reason, "job rejected by producer, job failed");
                }
                Err(err @ RegistryError::Corrupt(_)) => {
                    error!(job_id = job.id, error = %err, "corrupt job record, aborting dispatch cycle");
                    return Err(err);
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(job_id = job.id, error = %err, "dispatch failed, job left for next cycle");
                }
            }
        }
        Ok(report)
    }

    /// Whether `job` may only be placed on a host with spare capacity.
    fn needs_capacity(&self, job: &Job) -> bool {
        let Some(parent) = job.parent_job_id else {
            return true;
        };
        match self.registry.get_child_jobs(parent) {
            Ok(children) => children.iter().any(|c| c.status == JobStatus::Running),
            Err(e) => {
                debug!(job_id = job.id, parent, error = %e, "cannot read siblings, dispatching by capacity");
                true
            }
        }
    }

    /// Start the dispatch loop on the current tokio runtime.
    pub fn spawn(self, config: DispatcherConfig) -> DispatcherHandle {
        let (config_tx, config_rx) = watch::channel(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_dispatch_loop(self, config_rx, shutdown_rx));
        DispatcherHandle {
            config_tx,
            shutdown_tx,
            handle,
        }
    }

    async fn dispatch_once(&self) {
        let dispatcher = self.clone();
        match tokio::task::spawn_blocking(move || dispatcher.run_cycle()).await {
            Ok(Ok(report)) if report.scanned > 0 => debug!(
                scanned = report.scanned,
                dispatched = report.dispatched,
                requeued = report.requeued,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "dispatch cycle complete"
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "dispatch cycle failed"),
            Err(e) => error!(error = %e, "dispatch cycle panicked"),
        }
    }

    /// Log how many jobs are left unfinished, e.g. `Abandoned: 3 queued, 1 running`.
    fn log_abandoned(&self) {
        let counts = match self.registry.count_by_status() {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "could not count abandoned jobs");
                return;
            }
        };
        let mut summary = String::new();
        for (status, count) in counts.iter().filter(|(s, _)| !s.is_terminal()) {
            if !summary.is_empty() {
                summary.push_str(", ");
            }
            let _ = write!(summary, "{count} {status}");
        }
        if summary.is_empty() {
            info!("no unfinished jobs at dispatcher shutdown");
        } else {
            info!("Abandoned: {summary}");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

/// Control handle for a spawned dispatcher.
pub struct DispatcherHandle {
    config_tx: watch::Sender<DispatcherConfig>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Replace the dispatcher configuration. A pending wait is cut short and
    /// the new interval applies from then on.
    pub fn reload(&self, config: DispatcherConfig) {
        self.config_tx.send_replace(config);
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config_tx.borrow().clone()
    }

    /// Stop the loop and wait for a running cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "dispatcher task ended abnormally");
        }
    }
}

async fn run_dispatch_loop(
    dispatcher: JobDispatcher,
    mut config: watch::Receiver<DispatcherConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval = %config.borrow().interval, "job dispatcher started");

    loop {
        let interval = config.borrow_and_update().interval();
        match interval {
            Some(interval) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => dispatcher.dispatch_once().await,
                    changed = config.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!(interval = %config.borrow().interval, "dispatcher configuration reloaded");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                debug!("dispatching disabled, waiting for configuration change");
                tokio::select! {
                    changed = config.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!(interval = %config.borrow().interval, "dispatcher configuration reloaded");
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!("job dispatcher shutting down");
    dispatcher.log_abandoned();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    use jobgrid_state::{Job, JobStore};

    use crate::config::RegistryConfig;
    use crate::identity::SecurityService;
    use crate::producer::{JobProducer, Rejection};
    use crate::registry::{NewJob, ParentJob};

    const H1: &str = "http://h1:8080";

    /// Accepts everything and starts the job right away. Records the identity
    /// it was called under.
    struct Runner {
        registry: OnceLock<Arc<ServiceRegistry>>,
        operations: Vec<String>,
        panic_on: Option<String>,
        accepted: AtomicUsize,
        seen_users: std::sync::Mutex<Vec<Option<String>>>,
    }

    impl Runner {
        fn new(operations: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                registry: OnceLock::new(),
                operations: operations.iter().map(|s| s.to_string()).collect(),
                panic_on: None,
                accepted: AtomicUsize::new(0),
                seen_users: std::sync::Mutex::new(Vec::new()),
            })
        }

        /// Accepts `operations` but panics when handed `panic_on`.
        fn panicking_on(operations: &[&str], panic_on: &str) -> Arc<Self> {
            let mut runner = Arc::into_inner(Self::new(operations)).unwrap();
            runner.panic_on = Some(panic_on.to_string());
            Arc::new(runner)
        }
    }

    impl JobProducer for Runner {
        fn job_type(&self) -> &str {
            "ingest"
        }

        fn is_ready_to_accept_jobs(&self, operation: &str) -> bool {
            self.operations.iter().any(|o| o == operation)
        }

        fn is_ready_to_accept(&self, _job: &Job) -> bool {
            true
        }

        fn accept_job(&self, job: &Job) -> Result<(), Rejection> {
            if self.panic_on.as_deref() == Some(job.operation.as_str()) {
                panic!("encoder crashed on {}", job.operation);
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            let registry = self.registry.get().ok_or(Rejection("not wired".into()))?;
            self.seen_users.lock().unwrap().push(registry.security().user());
            let mut running = job.clone();
            running.status = JobStatus::Running;
            registry
                .update_job(&running)
                .map_err(|e| Rejection(e.to_string()))?;
            Ok(())
        }
    }

    fn setup(runner: &Arc<Runner>) -> Arc<ServiceRegistry> {
        let store = JobStore::open_in_memory().unwrap();
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default(), store).unwrap());
        registry.register_host(H1, "10.0.0.1", "h1", 4, 8 << 30, 2.0).unwrap();
        registry.register_producer(H1, "/ingest", runner.clone()).unwrap();
        runner.registry.set(registry.clone()).ok();
        registry
    }

    #[test]
    fn cycle_dispatches_under_creator_identity() {
        let runner = Runner::new(&["encode"]);
        let registry = setup(&runner);

        registry.security().set_user(Some("alice".into()));
        let job = registry.create_job("ingest", "encode").unwrap();
        registry.security().set_user(None);

        let report = JobDispatcher::new(registry.clone()).run_cycle().unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(registry.get_job(job.id).unwrap().status, JobStatus::Running);
        assert_eq!(*runner.seen_users.lock().unwrap(), vec![Some("alice".to_string())]);
        assert_eq!(registry.security().user(), None);
        assert_eq!(report.loads.get(H1).unwrap().current_load, 1.0);
    }

    #[test]
    fn no_service_fails_job_with_incident_and_scan_continues() {
        let runner = Runner::new(&["encode"]);
        let registry = setup(&runner);
        let orphan = registry.create_job("composer", "encode").unwrap();
        let job = registry.create_job("ingest", "encode").unwrap();

        let report = JobDispatcher::new(registry.clone()).run_cycle().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(registry.get_job(orphan.id).unwrap().status, JobStatus::Failed);
        assert_eq!(registry.get_job(job.id).unwrap().status, JobStatus::Running);

        let incidents = registry.incident().for_job(orphan.id);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].code, NO_SERVICE_INCIDENT);
    }

    #[test]
    fn undispatchable_signature_is_skipped_for_rest_of_cycle() {
        let runner = Runner::new(&["encode"]);
        let registry = setup(&runner);
        let first = registry.create_job("ingest", "trim").unwrap();
        let second = registry.create_job("ingest", "trim").unwrap();
        let other = registry.create_job("ingest", "encode").unwrap();

        let report = JobDispatcher::new(registry.clone()).run_cycle().unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 1);
        for id in [first.id, second.id] {
            assert_eq!(registry.get_job(id).unwrap().status, JobStatus::Queued);
        }
        assert_eq!(registry.get_job(other.id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn panicking_producer_requeues_job_and_scan_continues() {
        let runner = Runner::panicking_on(&["bad", "encode"], "bad");
        let registry = setup(&runner);
        let bad = registry.create_job("ingest", "bad").unwrap();
        let good = registry.create_job("ingest", "encode").unwrap();

        let dispatcher = JobDispatcher::new(registry.clone());
        let report = dispatcher.run_cycle().unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(registry.get_job(good.id).unwrap().status, JobStatus::Running);
        let requeued = registry.get_job(bad.id).unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.processing_host, None);

        // Retried on the next cycle rather than stuck in dispatching.
        let report = dispatcher.run_cycle().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(registry.get_job(bad.id).unwrap().status, JobStatus::Queued);
        assert_eq!(runner.accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn root_jobs_wait_for_capacity_children_do_not() {
        let runner = Runner::new(&["encode", "trim"]);
        let registry = setup(&runner);
        let roots: Vec<_> = (0..3)
            .map(|_| registry.create_job("ingest", "encode").unwrap())
            .collect();
        let parent = registry
            .create(NewJob::new("ingest", "workflow").not_queueable().with_parent(ParentJob::None))
            .unwrap();
        let child = registry
            .create(NewJob::new("ingest", "trim").with_parent(ParentJob::Id(parent.id)))
            .unwrap();

        let report = JobDispatcher::new(registry.clone()).run_cycle().unwrap();
        // h1 carries 2.0: two roots fit, the third waits, the child goes anyway.
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.requeued, 1);
        assert_eq!(registry.get_job(roots[2].id).unwrap().status, JobStatus::Queued);
        assert_eq!(registry.get_job(child.id).unwrap().status, JobStatus::Running);
        assert_eq!(report.loads.get(H1).unwrap().current_load, 3.0);
    }

    #[test]
    fn children_wait_for_capacity_once_a_sibling_runs() {
        let runner = Runner::new(&["encode", "trim"]);
        let registry = setup(&runner);
        let parent = registry
            .create(NewJob::new("ingest", "workflow").not_queueable().with_parent(ParentJob::None))
            .unwrap();
        let sibling = registry
            .create(NewJob::new("ingest", "encode").with_parent(ParentJob::Id(parent.id)).with_job_load(2.0))
            .unwrap();
        let dispatcher = JobDispatcher::new(registry.clone());
        assert_eq!(dispatcher.run_cycle().unwrap().dispatched, 1);
        assert_eq!(registry.get_job(sibling.id).unwrap().status, JobStatus::Running);

        let child = registry
            .create(NewJob::new("ingest", "trim").with_parent(ParentJob::Id(parent.id)))
            .unwrap();
        let report = dispatcher.run_cycle().unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(registry.get_job(child.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn instantiated_jobs_are_ignored() {
        let runner = Runner::new(&["encode"]);
        let registry = setup(&runner);
        let job = registry
            .create(NewJob::new("ingest", "encode").not_queueable())
            .unwrap();

        let report = JobDispatcher::new(registry.clone()).run_cycle().unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(registry.get_job(job.id).unwrap().status, JobStatus::Instantiated);
    }

    async fn wait_for_status(registry: &ServiceRegistry, id: u64, status: JobStatus) -> bool {
        for _ in 0..200 {
            if registry.get_job(id).unwrap().status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn spawned_loop_dispatches_and_shuts_down() {
        let runner = Runner::new(&["encode"]);
        let registry = setup(&runner);
        let handle = JobDispatcher::new(registry.clone())
            .spawn(DispatcherConfig::with_interval(Duration::from_millis(10)));

        let job = registry.create_job("ingest", "encode").unwrap();
        assert!(wait_for_status(&registry, job.id, JobStatus::Running).await);
        handle.shutdown().await;
        assert_eq!(runner.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_interval_disables_until_reload() {
        let runner = Runner::new(&["encode"]);
        let registry = setup(&runner);
        let handle = JobDispatcher::new(registry.clone()).spawn(DispatcherConfig {
            interval: "0".to_string(),
        });

        let job = registry.create_job("ingest", "encode").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.get_job(job.id).unwrap().status, JobStatus::Queued);

        handle.reload(DispatcherConfig::with_interval(Duration::from_millis(10)));
        assert_eq!(handle.config().interval(), Some(Duration::from_millis(10)));
        assert!(wait_for_status(&registry, job.id, JobStatus::Running).await);
        handle.shutdown().await;
    }
}
