//! HTTP execution capability.
//!
//! [`RemoteClient`](crate::RemoteClient) only needs to execute a request and
//! release a response it does not keep. [`HyperExecutor`] implements that
//! over a plain HTTP/1 connection per request.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::error::{HttpError, HttpResult};

/// Boxed future returned by [`HttpExecutor::execute`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes HTTP requests with fully buffered bodies.
pub trait HttpExecutor: Send + Sync {
    fn execute(&self, request: Request<Bytes>) -> BoxFuture<'_, HttpResult<Response<Bytes>>>;

    /// Release a response the caller does not hand on.
    fn close(&self, response: Response<Bytes>) {
        drop(response);
    }
}

/// Executor that opens one HTTP/1 connection per request.
///
/// Only `http://` URLs are supported. The connection is driven on a spawned
/// task and closes once the response has been read.
#[derive(Debug, Clone)]
pub struct HyperExecutor {
    timeout: Duration,
}

impl HyperExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn send(&self, request: Request<Bytes>) -> HttpResult<Response<Bytes>> {
        let (mut parts, body) = request.into_parts();
        match parts.uri.scheme_str() {
            Some("http") => {}
            other => {
                return Err(HttpError::UnsupportedScheme(
                    other.unwrap_or("<none>").to_string(),
                ));
            }
        }
        let authority = parts
            .uri
            .authority()
            .cloned()
            .ok_or_else(|| HttpError::InvalidRequest(format!("no host in {}", parts.uri)))?;
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        parts.headers.entry(HOST).or_insert(host);
        parts
            .headers
            .entry(USER_AGENT)
            .or_insert(HeaderValue::from_static("jobgrid-remote/0.1"));
        let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        parts.uri = path
            .parse::<Uri>()
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| HttpError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::Handshake(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "remote connection closed with error");
            }
        });

        let response = sender
            .send_request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?
            .to_bytes();
        Ok(Response::from_parts(parts, bytes))
    }
}

impl Default for HyperExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpExecutor for HyperExecutor {
    fn execute(&self, request: Request<Bytes>) -> BoxFuture<'_, HttpResult<Response<Bytes>>> {
        Box::pin(async move {
            let uri = request.uri().clone();
            match tokio::time::timeout(self.timeout, self.send(request)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(%uri, "remote request timed out");
                    Err(HttpError::Timeout(self.timeout))
                }
            }
        })
    }
}
