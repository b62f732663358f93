//! RemoteClient — call one of the peers offering a capability.
//!
//! A call resolves the registrations of a service type least-loaded first
//! and tries them in order until one answers with an accepted status. While
//! nobody offers the service, or while some peer fails in an unexpected way,
//! the client waits a poll interval and starts over with a fresh lookup. A
//! round in which every peer deliberately declines ends the call at once.
//! The whole call is bounded by a ceiling measured from its start.
//!
//! Absence of a response is the only failure signal. Callers decide whether
//! and when to try again.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jobgrid_registry::{RegistryResult, ServiceRegistry};
use jobgrid_state::ServiceRegistration;

use crate::config::RemoteConfig;
use crate::error::{HttpError, HttpResult};
use crate::http::HttpExecutor;
use crate::tracker::{PeerState, PeerTracker};

/// Lookup of the registrations offering a service type, least-loaded first.
pub trait ServiceLocator: Send + Sync {
    fn registrations_by_load(&self, service_type: &str) -> RegistryResult<Vec<ServiceRegistration>>;
}

/// Registrations on hosts that are disabled, offline or in maintenance are
/// left out.
impl ServiceLocator for ServiceRegistry {
    fn registrations_by_load(&self, service_type: &str) -> RegistryResult<Vec<ServiceRegistration>> {
        let mut regs = self.get_service_registrations_by_load(service_type)?;
        regs.retain(|r| self.host_accepts_work(&r.host));
        Ok(regs)
    }
}

impl<T: ServiceLocator + ?Sized> ServiceLocator for std::sync::Arc<T> {
    fn registrations_by_load(&self, service_type: &str) -> RegistryResult<Vec<ServiceRegistration>> {
        (**self).registrations_by_load(service_type)
    }
}

/// The part of a request that is the same for every peer.
///
/// `path` is appended to the peer's service URL.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RemoteRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn to_http(&self, service_url: &str) -> HttpResult<Request<Bytes>> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(format!("{service_url}{}", self.path))
            .body(self.body.clone())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        request.headers_mut().extend(self.headers.clone());
        Ok(request)
    }
}

/// Resilient client for calling a capability on some peer.
pub struct RemoteClient<L, H> {
    locator: L,
    http: H,
    config: RemoteConfig,
    peers: Mutex<PeerTracker>,
}

impl<L: ServiceLocator, H: HttpExecutor> RemoteClient<L, H> {
    pub fn new(locator: L, http: H, config: RemoteConfig) -> Self {
        Self {
            locator,
            http,
            config,
            peers: Mutex::new(PeerTracker::new()),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Last observed state of a peer service URL.
    pub fn peer_state(&self, service_url: &str) -> PeerState {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state(service_url)
    }

    /// Call `service_type` on the first peer that answers with a status in
    /// `accepted`.
    ///
    /// Returns `None` when every peer declined with a known-bad status in the
    /// same round, or when the ceiling elapsed.
    pub async fn call(
        &self,
        service_type: &str,
        request: &RemoteRequest,
        accepted: &[StatusCode],
    ) -> Option<Response<Bytes>> {
        let started = Instant::now();
        let ceiling = self.config.max_wait();

        loop {
            if started.elapsed() >= ceiling {
                warn!(%service_type, waited = ?started.elapsed(), "giving up on remote call");
                return None;
            }

            let candidates = self.resolve(service_type);
            if candidates.is_empty() {
                debug!(%service_type, "no peer offers the service, waiting");
                self.pause(started, ceiling).await;
                continue;
            }

            let mut unexpected = false;
            for reg in &candidates {
                let url = reg.url();
                let outcome = match request.to_http(&url) {
                    Ok(http_request) => self.http.execute(http_request).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(response) if accepted.contains(&response.status()) => {
                        if let Some(previous) = self.transition(&url, PeerState::Available) {
                            info!(peer = %url, from = %previous, "peer available again");
                        }
                        return Some(response);
                    }
                    Ok(response) if self.config.is_known_bad(response.status()) => {
                        if let Some(previous) = self.transition(&url, PeerState::Declining) {
                            info!(peer = %url, status = %response.status(), from = %previous, "peer declined request");
                        }
                        self.http.close(response);
                    }
                    Ok(response) => {
                        if let Some(previous) = self.transition(&url, PeerState::Failing) {
                            warn!(peer = %url, status = %response.status(), from = %previous, "unexpected response from peer");
                        }
                        unexpected = true;
                        self.http.close(response);
                    }
                    Err(e) => {
                        if let Some(previous) = self.transition(&url, PeerState::Failing) {
                            warn!(peer = %url, error = %e, from = %previous, "peer unreachable");
                        }
                        unexpected = true;
                    }
                }
            }

            if !unexpected {
                debug!(%service_type, peers = candidates.len(), "every peer declined, not retrying");
                return None;
            }
            self.pause(started, ceiling).await;
        }
    }

    /// Like [`call`](Self::call), but gives up as soon as `shutdown` turns
    /// true.
    pub async fn call_with_shutdown(
        &self,
        service_type: &str,
        request: &RemoteRequest,
        accepted: &[StatusCode],
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<Response<Bytes>> {
        tokio::select! {
            response = self.call(service_type, request, accepted) => response,
            _ = cancelled(&mut shutdown) => {
                info!(%service_type, "remote call cancelled");
                None
            }
        }
    }

    /// Current candidates, without registrations in maintenance.
    fn resolve(&self, service_type: &str) -> Vec<ServiceRegistration> {
        match self.locator.registrations_by_load(service_type) {
            Ok(regs) => regs
                .into_iter()
                .filter(|r| r.online && !r.maintenance_mode)
                .collect(),
            Err(e) => {
                warn!(%service_type, error = %e, "service lookup failed");
                Vec::new()
            }
        }
    }

    fn transition(&self, url: &str, state: PeerState) -> Option<PeerState> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(url, state)
    }

    /// Sleep one poll interval, or less if the ceiling comes first.
    async fn pause(&self, started: Instant, ceiling: Duration) {
        let remaining = ceiling.saturating_sub(started.elapsed());
        tokio::time::sleep(self.config.poll_interval().min(remaining)).await;
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is
/// dropped without requesting it.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::http::BoxFuture;

    const H1: &str = "http://h1:8080";
    const H2: &str = "http://h2:8080";

    fn ingest_on(host: &str) -> ServiceRegistration {
        ServiceRegistration::new("ingest", host, "/ingest", true)
    }

    /// Returns nothing for the first `appear_after` lookups.
    #[derive(Default)]
    struct FakeLocator {
        registrations: Mutex<Vec<ServiceRegistration>>,
        appear_after: usize,
        lookups: AtomicUsize,
    }

    impl FakeLocator {
        fn with(registrations: Vec<ServiceRegistration>) -> Self {
            Self {
                registrations: Mutex::new(registrations),
                ..Default::default()
            }
        }
    }

    impl ServiceLocator for FakeLocator {
        fn registrations_by_load(&self, service_type: &str) -> RegistryResult<Vec<ServiceRegistration>> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.appear_after {
                return Ok(Vec::new());
            }
            Ok(self
                .registrations
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.service_type == service_type)
                .cloned()
                .collect())
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Status(u16),
        Unreachable,
    }

    /// Scripted replies per URL. The last reply repeats.
    #[derive(Default)]
    struct FakeHttp {
        scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<String>>,
        closed: AtomicUsize,
    }

    impl FakeHttp {
        fn script(self, url: &str, replies: &[Reply]) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.to_string(), replies.iter().copied().collect());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl HttpExecutor for Arc<FakeHttp> {
        fn execute(&self, request: Request<Bytes>) -> BoxFuture<'_, HttpResult<Response<Bytes>>> {
            let url = request.uri().to_string();
            self.calls.lock().unwrap().push(url.clone());
            let reply = {
                let mut scripts = self.scripts.lock().unwrap();
                let script = scripts.entry(url.clone()).or_default();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().copied()
                }
            };
            Box::pin(async move {
                match reply.unwrap_or(Reply::Unreachable) {
                    Reply::Status(code) => Ok(Response::builder()
                        .status(code)
                        .body(Bytes::from_static(b"ok"))
                        .unwrap()),
                    Reply::Unreachable => Err(HttpError::Connect {
                        address: url,
                        reason: "connection refused".into(),
                    }),
                }
            })
        }

        fn close(&self, response: Response<Bytes>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            drop(response);
        }
    }

    fn client(locator: FakeLocator, http: &Arc<FakeHttp>) -> RemoteClient<FakeLocator, Arc<FakeHttp>> {
        RemoteClient::new(locator, http.clone(), RemoteConfig::default())
    }

    const OK: &[StatusCode] = &[StatusCode::OK];

    #[tokio::test(start_paused = true)]
    async fn first_accepting_peer_short_circuits() {
        let http = Arc::new(
            FakeHttp::default()
                .script("http://h1:8080/ingest/encode", &[Reply::Status(200)])
                .script("http://h2:8080/ingest/encode", &[Reply::Status(200)]),
        );
        let client = client(FakeLocator::with(vec![ingest_on(H1), ingest_on(H2)]), &http);

        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert_eq!(response.unwrap().status(), StatusCode::OK);
        assert_eq!(http.calls(), vec!["http://h1:8080/ingest/encode"]);
    }

    #[tokio::test(start_paused = true)]
    async fn all_known_bad_returns_none_immediately() {
        let http = Arc::new(
            FakeHttp::default()
                .script("http://h1:8080/ingest/encode", &[Reply::Status(503)])
                .script("http://h2:8080/ingest/encode", &[Reply::Status(503)]),
        );
        let client = client(FakeLocator::with(vec![ingest_on(H1), ingest_on(H2)]), &http);

        let started = Instant::now();
        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert!(response.is_none());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(http.calls().len(), 2);
        assert_eq!(http.closed.load(Ordering::SeqCst), 2);
        assert_eq!(client.peer_state("http://h1:8080/ingest"), PeerState::Declining);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_failure_falls_through_to_next_peer() {
        let http = Arc::new(
            FakeHttp::default()
                .script("http://h1:8080/ingest/encode", &[Reply::Status(500)])
                .script("http://h2:8080/ingest/encode", &[Reply::Status(200)]),
        );
        let client = client(FakeLocator::with(vec![ingest_on(H1), ingest_on(H2)]), &http);

        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert!(response.is_some());
        assert_eq!(http.closed.load(Ordering::SeqCst), 1);
        assert_eq!(client.peer_state("http://h1:8080/ingest"), PeerState::Failing);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_registration_to_appear() {
        let http = Arc::new(
            FakeHttp::default().script("http://h1:8080/ingest/encode", &[Reply::Status(200)]),
        );
        let locator = FakeLocator {
            appear_after: 2,
            ..FakeLocator::with(vec![ingest_on(H1)])
        };
        let client = client(locator, &http);

        let started = Instant::now();
        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert!(response.is_some());
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(client.locator.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_failures_retry_after_poll_interval() {
        let http = Arc::new(FakeHttp::default().script(
            "http://h1:8080/ingest/encode",
            &[Reply::Unreachable, Reply::Status(500), Reply::Status(200)],
        ));
        let client = client(FakeLocator::with(vec![ingest_on(H1)]), &http);

        let started = Instant::now();
        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert!(response.is_some());
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(client.peer_state("http://h1:8080/ingest"), PeerState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_bounds_the_whole_call() {
        let http = Arc::new(
            FakeHttp::default().script("http://h1:8080/ingest/encode", &[Reply::Status(500)]),
        );
        let config = RemoteConfig {
            max_wait: "25s".to_string(),
            ..RemoteConfig::default()
        };
        let client = RemoteClient::new(FakeLocator::with(vec![ingest_on(H1)]), http.clone(), config);

        let started = Instant::now();
        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert!(response.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(25));
        assert_eq!(http.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_peers_are_not_called() {
        let mut resting = ingest_on(H1);
        resting.maintenance_mode = true;
        let http = Arc::new(
            FakeHttp::default().script("http://h2:8080/ingest/encode", &[Reply::Status(200)]),
        );
        let client = client(FakeLocator::with(vec![resting, ingest_on(H2)]), &http);

        let response = client.call("ingest", &RemoteRequest::get("/encode"), OK).await;
        assert!(response.is_some());
        assert_eq!(http.calls(), vec!["http://h2:8080/ingest/encode"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_a_waiting_call() {
        let http = Arc::new(FakeHttp::default());
        let locator = FakeLocator {
            appear_after: usize::MAX,
            ..FakeLocator::default()
        };
        let client = client(locator, &http);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            tx.send(true).unwrap();
        });

        let started = Instant::now();
        let response = client
            .call_with_shutdown("ingest", &RemoteRequest::get("/encode"), OK, rx)
            .await;
        assert!(response.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert!(http.calls().is_empty());
    }

    #[test]
    fn request_targets_service_url_plus_suffix() {
        let request = RemoteRequest::post("/encode", "track-1")
            .with_header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let http_request = request.to_http(&ingest_on(H1).url()).unwrap();
        assert_eq!(http_request.method(), Method::POST);
        assert_eq!(http_request.uri(), "http://h1:8080/ingest/encode");
        assert_eq!(http_request.body().as_ref(), b"track-1");
        assert_eq!(http_request.headers()[http::header::CONTENT_TYPE], "text/plain");
    }
}
