//! jobgrid-state — domain types and job persistence for jobgrid.
//!
//! Holds the plain data model shared by every other crate (jobs, host and
//! service registrations, load snapshots) plus the [`JobStore`], a
//! [redb](https://docs.rs/redb)-backed table of jobs keyed by id.
//!
//! # Architecture
//!
//! Jobs are encoded to JSON by the functions in [`codec`] and written into
//! redb's `&[u8]` value column. The types themselves carry no storage logic;
//! only the codec and the store know about the on-disk representation.
//!
//! The `JobStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and supports both an on-disk file and an in-memory backend.

pub mod codec;
pub mod error;
pub mod load;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use load::{NodeLoad, SystemLoad};
pub use store::JobStore;
pub use types::*;
