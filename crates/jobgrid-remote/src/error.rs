//! HTTP transport errors.

use std::time::Duration;

use thiserror::Error;

/// Errors from executing a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("http handshake failed: {0}")]
    Handshake(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("reading response body failed: {0}")]
    Body(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

pub type HttpResult<T> = Result<T, HttpError>;
