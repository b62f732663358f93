//! jobgrid-registry — service registry, load accounting and job dispatch.
//!
//! Nodes register as hosts and offer capabilities as service registrations.
//! Callers create jobs; the background dispatcher hands each queued job to
//! the least-loaded registration whose producer accepts it.
//!
//! # Architecture
//!
//! ```text
//! JobDispatcher (periodic, fixed delay)
//!   └── ServiceRegistry
//!       ├── hosts        Mutex<BTreeMap<HostUrl, HostRegistration>>
//!       ├── services     Mutex<registrations + producers + assignments>
//!       ├── jobs         Mutex<JobStore>          (jobgrid-state, redb)
//!       ├── SecurityService                       (ambient identity)
//!       └── Incidents                             (per-job incident sink)
//! ```
//!
//! Locks are taken in the order hosts → services → jobs. Producers are
//! always called with no registry lock held.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod incident;
pub mod producer;
pub mod registry;

pub use config::{DispatcherConfig, RegistryConfig, parse_duration};
pub use dispatcher::{CycleReport, DispatcherHandle, JobDispatcher, NO_SERVICE_INCIDENT};
pub use error::{RegistryError, RegistryResult};
pub use identity::{IdentityScope, SecurityService, ThreadSecurityService};
pub use incident::{InMemoryIncidentService, Incident, IncidentService, Incidents, Severity};
pub use producer::{JobProducer, Rejection};
pub use registry::{DispatchOutcome, JobQuery, NewJob, ParentJob, ServiceRegistry};
