//! The control-plane record store.
//!
//! In-memory state with optional JSON snapshots, shared behind an `Arc`.
//! Multi-statement atomicity comes from [`Store::with_tx`]: the closure runs
//! against a clone of the state, and the clone replaces the live state only
//! when the closure succeeds.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use strata_proto::NodeResources;
use tracing::warn;
use uuid::Uuid;

use crate::entities::{DeploymentRecord, DeploymentStatus, LogRecord, NodeRecord};
use crate::snapshot::JsonSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node {0:?} not found")]
    NodeNotFound(String),
    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
    #[error("deployment {id} is {status}, not requeueable")]
    NotRequeueable { id: Uuid, status: DeploymentStatus },
}

// ─── State ────────────────────────────────────────────────────────────────────

/// The entity maps a transaction operates on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    nodes: HashMap<String, NodeRecord>,
    deployments: HashMap<Uuid, DeploymentRecord>,
    logs: Vec<LogRecord>,
}

impl StoreState {
    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Result<&mut NodeRecord, StoreError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_string()))
    }

    pub fn put_node(&mut self, record: NodeRecord) {
        self.nodes.insert(record.id.clone(), record);
    }

    pub fn deployment(&self, id: Uuid) -> Option<&DeploymentRecord> {
        self.deployments.get(&id)
    }

    pub fn deployment_mut(&mut self, id: Uuid) -> Result<&mut DeploymentRecord, StoreError> {
        self.deployments
            .get_mut(&id)
            .ok_or(StoreError::DeploymentNotFound(id))
    }

    pub fn put_deployment(&mut self, record: DeploymentRecord) {
        self.deployments.insert(record.id, record);
    }

    /// Validated lifecycle transition with timestamp stamping:
    /// `started_at` on first entry to Running, `finished_at` on
    /// Stopped/Failed, `updated_at` always.
    pub fn transition(&mut self, id: Uuid, to: DeploymentStatus) -> Result<(), StoreError> {
        let d = self.deployment_mut(id)?;
        if !d.status.can_transition(to) {
            return Err(StoreError::InvalidTransition { from: d.status, to });
        }
        let now = Utc::now();
        d.status = to;
        d.updated_at = now;
        match to {
            DeploymentStatus::Running if d.started_at.is_none() => d.started_at = Some(now),
            DeploymentStatus::Stopped | DeploymentStatus::Failed => d.finished_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

struct Snapshots {
    nodes: JsonSnapshot,
    deployments: JsonSnapshot,
    logs: JsonSnapshot,
}

pub struct Store {
    inner: RwLock<StoreState>,
    snapshots: Option<Snapshots>,
}

impl Store {
    /// Volatile store for tests and ephemeral deployments.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(StoreState::default()),
            snapshots: None,
        }
    }

    /// Store backed by JSON snapshots under `state_path`, loading any
    /// existing state from disk.
    pub fn open(state_path: &Path) -> Self {
        let snapshots = Snapshots {
            nodes: JsonSnapshot::new(state_path, "nodes"),
            deployments: JsonSnapshot::new(state_path, "deployments"),
            logs: JsonSnapshot::new(state_path, "logs"),
        };
        let state = StoreState {
            nodes: snapshots.nodes.load(),
            deployments: snapshots.deployments.load(),
            logs: snapshots.logs.load(),
        };
        Self {
            inner: RwLock::new(state),
            snapshots: Some(snapshots),
        }
    }

    fn persist(&self, state: &StoreState) {
        let Some(snaps) = &self.snapshots else { return };
        if let Err(e) = snaps.nodes.save(&state.nodes) {
            warn!(error = %e, "failed to snapshot nodes");
        }
        if let Err(e) = snaps.deployments.save(&state.deployments) {
            warn!(error = %e, "failed to snapshot deployments");
        }
        if let Err(e) = snaps.logs.save(&state.logs) {
            warn!(error = %e, "failed to snapshot logs");
        }
    }

    /// Run a multi-statement transaction. The closure sees a clone of the
    /// state; the clone is committed (and snapshotted) only on `Ok`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.write();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        *guard = working;
        self.persist(&guard);
        Ok(out)
    }

    // ─── Nodes ───────────────────────────────────────────────────────────────

    pub fn upsert_node(&self, record: NodeRecord) {
        let mut guard = self.inner.write();
        guard.nodes.insert(record.id.clone(), record);
        self.persist(&guard);
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeRecord> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<_> = self.inner.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Refresh a node's heartbeat timestamp and, when provided, its
    /// resources and cached paths — a single atomic update. A heartbeat is
    /// direct evidence of liveness, so the persisted `healthy` flag flips
    /// back on here; the classifier clears it again when heartbeats stop.
    pub fn update_node_heartbeat(
        &self,
        node_id: &str,
        resources: Option<&NodeResources>,
        cached_paths: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        let node = guard.node_mut(node_id)?;
        node.last_heartbeat = now;
        node.healthy = true;
        if let Some(res) = resources {
            node.resources = res.clone();
        }
        if let Some(paths) = cached_paths {
            node.cached_paths = paths.to_vec();
        }
        self.persist(&guard);
        Ok(())
    }

    pub fn update_node_health(&self, node_id: &str, healthy: bool) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        guard.node_mut(node_id)?.healthy = healthy;
        self.persist(&guard);
        Ok(())
    }

    pub fn set_node_draining(&self, node_id: &str, draining: bool) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        guard.node_mut(node_id)?.draining = draining;
        self.persist(&guard);
        Ok(())
    }

    // ─── Deployments ─────────────────────────────────────────────────────────

    pub fn insert_deployment(&self, record: DeploymentRecord) {
        let mut guard = self.inner.write();
        guard.deployments.insert(record.id, record);
        self.persist(&guard);
    }

    pub fn get_deployment(&self, id: Uuid) -> Option<DeploymentRecord> {
        self.inner.read().deployments.get(&id).cloned()
    }

    pub fn list_by_status(&self, status: DeploymentStatus) -> Vec<DeploymentRecord> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .deployments
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }

    pub fn list_by_node(&self, node_id: &str) -> Vec<DeploymentRecord> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .deployments
            .values()
            .filter(|d| d.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }

    /// All deployments of a service, ascending by version.
    pub fn list_for_service(&self, app_id: &str, service_name: &str) -> Vec<DeploymentRecord> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .deployments
            .values()
            .filter(|d| d.app_id == app_id && d.service_name == service_name)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.version);
        out
    }

    /// The highest-version deployment of a service, if any.
    pub fn latest_for_service(&self, app_id: &str, service_name: &str) -> Option<DeploymentRecord> {
        self.inner
            .read()
            .deployments
            .values()
            .filter(|d| d.app_id == app_id && d.service_name == service_name)
            .max_by_key(|d| d.version)
            .cloned()
    }

    /// Next version number for a service. Versions start at 1 and increase
    /// strictly per {app_id, service_name}.
    pub fn next_version(&self, app_id: &str, service_name: &str) -> i64 {
        self.inner
            .read()
            .deployments
            .values()
            .filter(|d| d.app_id == app_id && d.service_name == service_name)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Validated status transition; see [`StoreState::transition`].
    pub fn transition_status(
        &self,
        id: Uuid,
        to: DeploymentStatus,
    ) -> Result<DeploymentRecord, StoreError> {
        self.with_tx(|state| {
            state.transition(id, to)?;
            Ok(state.deployment(id).cloned().expect("present after transition"))
        })
    }

    /// Requeue a deployment for placement after its node was lost. Clears
    /// the assignment and moves {Scheduled, Starting, Running} back to
    /// Built — an edge outside the worker-observable lifecycle.
    pub fn requeue_deployment(&self, id: Uuid) -> Result<DeploymentRecord, StoreError> {
        self.with_tx(|state| {
            let d = state.deployment_mut(id)?;
            match d.status {
                DeploymentStatus::Scheduled
                | DeploymentStatus::Starting
                | DeploymentStatus::Running => {
                    d.status = DeploymentStatus::Built;
                    d.node_id = None;
                    d.started_at = None;
                    d.updated_at = Utc::now();
                    Ok(d.clone())
                }
                status => Err(StoreError::NotRequeueable { id, status }),
            }
        })
    }

    // ─── Logs ────────────────────────────────────────────────────────────────

    pub fn append_log(&self, record: LogRecord) {
        let mut guard = self.inner.write();
        guard.logs.push(record);
        self.persist(&guard);
    }

    pub fn logs_for_deployment(&self, deployment_id: Uuid) -> Vec<LogRecord> {
        self.inner
            .read()
            .logs
            .iter()
            .filter(|l| l.deployment_id == deployment_id)
            .cloned()
            .collect()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
