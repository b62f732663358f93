//! jobgrid-remote — resilient calls to whichever peer offers a capability.
//!
//! A caller names a service type; the [`RemoteClient`] looks up the
//! registrations offering it, least-loaded first, and tries them in turn
//! until one accepts the request.
//!
//! # Architecture
//!
//! ```text
//! RemoteClient
//!   ├── ServiceLocator (registrations by load, e.g. ServiceRegistry)
//!   ├── HttpExecutor   (execute + close, e.g. HyperExecutor)
//!   └── PeerTracker    (last state per peer, logs transitions only)
//! ```
//!
//! # Retry protocol
//!
//! - No registration yet: wait `poll_interval` (10s) and look up again.
//! - Every peer declined with a known-bad status (503): return `None` now.
//! - Any peer failed unexpectedly: wait `poll_interval`, then start over
//!   with a fresh lookup.
//! - The whole call gives up after `max_wait` (24h) from its start.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod tracker;

pub use client::{RemoteClient, RemoteRequest, ServiceLocator};
pub use config::RemoteConfig;
pub use error::{HttpError, HttpResult};
pub use http::{BoxFuture, HttpExecutor, HyperExecutor};
pub use tracker::{PeerState, PeerTracker};
