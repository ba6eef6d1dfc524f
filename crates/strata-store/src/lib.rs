//! Record store for the Strata control plane.
//!
//! Entities, the deployment lifecycle state machine, and [`Store`] — an
//! in-memory transactional store with optional JSON snapshots. Nodes,
//! deployments, and logs live here; connection state does not (that is the
//! node manager's).

#![forbid(unsafe_code)]

pub mod entities;
pub mod snapshot;
pub mod store;

pub use entities::{
    DeploymentRecord, DeploymentStatus, LogRecord, NodeRecord, ResourceSpec, ServiceAction,
    ServiceState,
};
pub use store::{Store, StoreError, StoreState};
