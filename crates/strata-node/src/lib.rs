//! Node connection registry and command routing.
//!
//! The [`NodeManager`] owns every live worker connection. Commands reach a
//! worker through the connection's outbound channel, whose single consumer
//! is the socket task — no other task ever writes to a worker's stream.
//! Health classification from heartbeat age lives in [`classifier`].

#![forbid(unsafe_code)]

pub mod classifier;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strata_proto::{CommandPayload, DeploymentCommand, NodeHealth, RpcCode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("node {0} has no registered connection")]
    NotConnected(String),
    #[error("node {0} is down")]
    Unavailable(String),
    #[error("deployment {0} already has a deploy command in flight")]
    AlreadyExists(Uuid),
    #[error("outbound channel to node {0} is closed")]
    ChannelClosed(String),
}

impl SendError {
    /// Status-code view for the retry policy. A missing or closed
    /// connection behaves like an unavailable node: the worker may
    /// reconnect within the retry window.
    pub fn code(&self) -> RpcCode {
        match self {
            Self::NotConnected(_) | Self::Unavailable(_) | Self::ChannelClosed(_) => {
                RpcCode::Unavailable
            }
            Self::AlreadyExists(_) => RpcCode::AlreadyExists,
        }
    }
}

// ─── Connection ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ConnState {
    last_heartbeat: DateTime<Utc>,
    status: NodeHealth,
    active_deployments: HashSet<Uuid>,
    draining: bool,
}

/// One live worker connection. At most one exists per node id; a reconnect
/// replaces the old one atomically and the displaced socket task observes
/// its channel closing and exits.
#[derive(Debug)]
pub struct NodeConnection {
    node_id: String,
    sender: mpsc::Sender<DeploymentCommand>,
    state: Mutex<ConnState>,
}

impl NodeConnection {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> NodeHealth {
        self.state.lock().status
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.state.lock().last_heartbeat
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn active_deployments(&self) -> Vec<Uuid> {
        self.state.lock().active_deployments.iter().copied().collect()
    }
}

/// A node's classification change, as observed by one classifier pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub node_id: String,
    pub from: NodeHealth,
    pub to: NodeHealth,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

/// Owner of the in-memory connection map.
///
/// Locking: the map mutex is only held for lookups and insert/remove; per
/// connection state has its own mutex. Neither is ever held across I/O —
/// command writes go through `try_send` on a buffered channel.
pub struct NodeManager {
    connections: Mutex<HashMap<String, Arc<NodeConnection>>>,
    last_broadcast_error: Mutex<Option<String>>,
}

impl NodeManager {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            last_broadcast_error: Mutex::new(None),
        }
    }

    /// Register (or replace) the connection for `node_id`. Liveness resets
    /// to now/Healthy. The returned handle identifies this registration for
    /// [`Self::unregister_exact`].
    pub fn register_connection(
        &self,
        node_id: &str,
        sender: mpsc::Sender<DeploymentCommand>,
    ) -> Arc<NodeConnection> {
        let conn = Arc::new(NodeConnection {
            node_id: node_id.to_string(),
            sender,
            state: Mutex::new(ConnState {
                last_heartbeat: Utc::now(),
                status: NodeHealth::Healthy,
                active_deployments: HashSet::new(),
                draining: false,
            }),
        });
        let previous = self
            .connections
            .lock()
            .insert(node_id.to_string(), conn.clone());
        if previous.is_some() {
            info!(node_id, "replaced existing connection");
        } else {
            info!(node_id, "registered connection");
        }
        conn
    }

    /// Idempotent removal by node id.
    pub fn unregister_connection(&self, node_id: &str) {
        if self.connections.lock().remove(node_id).is_some() {
            info!(node_id, "unregistered connection");
        }
    }

    /// Remove `conn` only if it is still the registered connection for its
    /// node. A socket task calls this on exit; after a reconnect has
    /// replaced it, the newer registration is left untouched.
    pub fn unregister_exact(&self, conn: &Arc<NodeConnection>) {
        let mut map = self.connections.lock();
        if let Some(current) = map.get(&conn.node_id) {
            if Arc::ptr_eq(current, conn) {
                map.remove(&conn.node_id);
                info!(node_id = %conn.node_id, "unregistered connection");
            }
        }
    }

    pub fn get_connection(&self, node_id: &str) -> Option<Arc<NodeConnection>> {
        self.connections.lock().get(node_id).cloned()
    }

    /// Refresh liveness from a heartbeat. Degraded and Down connections
    /// recover to Healthy here.
    pub fn update_heartbeat(&self, node_id: &str, draining: Option<bool>) -> Result<(), SendError> {
        let conn = self
            .get_connection(node_id)
            .ok_or_else(|| SendError::NotConnected(node_id.to_string()))?;
        let mut state = conn.state.lock();
        state.last_heartbeat = Utc::now();
        if state.status != NodeHealth::Healthy {
            debug!(node_id, from = %state.status, "heartbeat recovery");
            state.status = NodeHealth::Healthy;
        }
        if let Some(draining) = draining {
            state.draining = draining;
        }
        Ok(())
    }

    /// Route a command to a node's outbound stream.
    ///
    /// Contract: `NotConnected` without a registration, `Unavailable` when
    /// the connection is Down, `AlreadyExists` for a Deploy whose
    /// deployment already has a command in flight. On success a Deploy's
    /// deployment id joins the connection's active set.
    pub fn send_command(&self, node_id: &str, cmd: DeploymentCommand) -> Result<(), SendError> {
        let conn = self
            .get_connection(node_id)
            .ok_or_else(|| SendError::NotConnected(node_id.to_string()))?;

        let mut state = conn.state.lock();
        if state.status == NodeHealth::Down {
            return Err(SendError::Unavailable(node_id.to_string()));
        }
        let deploy_id = match &cmd.payload {
            CommandPayload::Deploy(p) => {
                if state.active_deployments.contains(&p.deployment_id) {
                    return Err(SendError::AlreadyExists(p.deployment_id));
                }
                Some(p.deployment_id)
            }
            _ => None,
        };

        conn.sender
            .try_send(cmd)
            .map_err(|_| SendError::ChannelClosed(node_id.to_string()))?;

        if let Some(id) = deploy_id {
            state.active_deployments.insert(id);
        }
        Ok(())
    }

    /// Clear a deployment from the node's active set, allowing the same id
    /// to be deployed again.
    pub fn mark_deployment_complete(&self, node_id: &str, deployment_id: Uuid) {
        if let Some(conn) = self.get_connection(node_id) {
            conn.state.lock().active_deployments.remove(&deployment_id);
        }
    }

    /// Best-effort fan-out to every connection. Returns the number of
    /// successful sends; the last error is recorded for inspection.
    pub fn broadcast_command(&self, cmd: &DeploymentCommand) -> usize {
        let conns: Vec<_> = self.connections.lock().values().cloned().collect();
        let mut delivered = 0;
        for conn in conns {
            match self.send_command(&conn.node_id, cmd.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(node_id = %conn.node_id, error = %e, "broadcast send failed");
                    *self.last_broadcast_error.lock() = Some(e.to_string());
                }
            }
        }
        delivered
    }

    pub fn last_broadcast_error(&self) -> Option<String> {
        self.last_broadcast_error.lock().clone()
    }

    /// Node ids whose connection is Healthy — not Degraded, not Down.
    /// Degraded nodes still receive commands but take no new placements.
    pub fn healthy_nodes(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .connections
            .lock()
            .values()
            .filter(|c| c.state.lock().status == NodeHealth::Healthy)
            .map(|c| c.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Operator/worker drain signal. Consulted by the scheduler; does not
    /// change health status.
    pub fn set_node_draining(&self, node_id: &str, draining: bool) -> Result<(), SendError> {
        let conn = self
            .get_connection(node_id)
            .ok_or_else(|| SendError::NotConnected(node_id.to_string()))?;
        conn.state.lock().draining = draining;
        Ok(())
    }

    /// Current classification of every connection, for fleet summaries.
    pub fn connection_statuses(&self) -> Vec<(String, NodeHealth, bool)> {
        let mut out: Vec<_> = self
            .connections
            .lock()
            .values()
            .map(|c| {
                let state = c.state.lock();
                (c.node_id.clone(), state.status, state.draining)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// One classifier pass: recompute every connection's status from its
    /// heartbeat age at `now`, returning the transitions that occurred.
    pub fn classify_all(
        &self,
        now: DateTime<Utc>,
        thresholds: &classifier::HealthThresholds,
    ) -> Vec<HealthTransition> {
        let conns: Vec<_> = self.connections.lock().values().cloned().collect();
        let mut transitions = Vec::new();
        for conn in conns {
            let mut state = conn.state.lock();
            let elapsed = (now - state.last_heartbeat)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            let next = classifier::classify(elapsed, thresholds);
            if next != state.status {
                transitions.push(HealthTransition {
                    node_id: conn.node_id.clone(),
                    from: state.status,
                    to: next,
                });
                state.status = next;
            }
        }
        transitions
    }
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use super::classifier::HealthThresholds;
    use strata_proto::{BuildType, DeployPayload, RestartPayload, ServiceConfig};

    fn deploy_cmd(deployment_id: Uuid) -> DeploymentCommand {
        DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: Utc::now() + ChronoDuration::seconds(10),
            payload: CommandPayload::Deploy(DeployPayload {
                deployment_id,
                app_id: "a-1".to_string(),
                service_name: "api".to_string(),
                version: 1,
                build_type: BuildType::Oci,
                artifact: "registry/api:1".to_string(),
                config: ServiceConfig::default(),
            }),
        }
    }

    fn restart_cmd() -> DeploymentCommand {
        DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: Utc::now() + ChronoDuration::seconds(10),
            payload: CommandPayload::Restart(RestartPayload {
                deployment_id: Uuid::new_v4(),
            }),
        }
    }

    #[test]
    fn send_without_connection_is_not_connected() {
        let mgr = NodeManager::new();
        let err = mgr.send_command("n-ghost", restart_cmd()).unwrap_err();
        assert!(matches!(err, SendError::NotConnected(_)));
        assert_eq!(err.code(), RpcCode::Unavailable);
    }

    #[test]
    fn duplicate_deploy_suppressed_until_complete() {
        let mgr = NodeManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        mgr.register_connection("n-1", tx);

        let dep = Uuid::new_v4();
        mgr.send_command("n-1", deploy_cmd(dep)).expect("first deploy");

        let err = mgr.send_command("n-1", deploy_cmd(dep)).unwrap_err();
        assert!(matches!(err, SendError::AlreadyExists(id) if id == dep));
        assert_eq!(err.code(), RpcCode::AlreadyExists);

        mgr.mark_deployment_complete("n-1", dep);
        mgr.send_command("n-1", deploy_cmd(dep)).expect("re-deploy after complete");

        // Exactly two commands reached the stream.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_to_down_node_is_unavailable() {
        let mgr = NodeManager::new();
        let (tx, _rx) = mpsc::channel(8);
        let conn = mgr.register_connection("n-1", tx);
        conn.state.lock().status = NodeHealth::Down;

        let err = mgr.send_command("n-1", restart_cmd()).unwrap_err();
        assert!(matches!(err, SendError::Unavailable(_)));
    }

    #[test]
    fn send_to_degraded_node_succeeds() {
        let mgr = NodeManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = mgr.register_connection("n-1", tx);
        conn.state.lock().status = NodeHealth::Degraded;

        mgr.send_command("n-1", restart_cmd()).expect("degraded delivery");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn healthy_nodes_excludes_degraded_and_down() {
        let mgr = NodeManager::new();
        for (id, status) in [
            ("n-a", NodeHealth::Healthy),
            ("n-b", NodeHealth::Degraded),
            ("n-c", NodeHealth::Down),
        ] {
            let (tx, _rx) = mpsc::channel(1);
            let conn = mgr.register_connection(id, tx);
            conn.state.lock().status = status;
        }
        assert_eq!(mgr.healthy_nodes(), vec!["n-a".to_string()]);
    }

    #[test]
    fn reconnect_replaces_and_exact_unregister_spares_newer() {
        let mgr = NodeManager::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let old = mgr.register_connection("n-1", tx1);
        let (tx2, _rx2) = mpsc::channel(1);
        let new = mgr.register_connection("n-1", tx2);

        // The displaced task's exit must not remove the new registration.
        mgr.unregister_exact(&old);
        assert!(mgr.get_connection("n-1").is_some());
        assert!(Arc::ptr_eq(&mgr.get_connection("n-1").unwrap(), &new));

        mgr.unregister_exact(&new);
        assert!(mgr.get_connection("n-1").is_none());

        // Idempotent by-id removal.
        mgr.unregister_connection("n-1");
    }

    #[test]
    fn heartbeat_recovers_status_and_sets_draining() {
        let mgr = NodeManager::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn = mgr.register_connection("n-1", tx);
        conn.state.lock().status = NodeHealth::Down;

        mgr.update_heartbeat("n-1", Some(true)).expect("heartbeat");
        assert_eq!(conn.status(), NodeHealth::Healthy);
        assert!(conn.is_draining());

        assert!(mgr.update_heartbeat("n-ghost", None).is_err());
    }

    #[test]
    fn broadcast_counts_successes_and_records_error() {
        let mgr = NodeManager::new();
        let (tx_ok, mut rx_ok) = mpsc::channel(8);
        mgr.register_connection("n-ok", tx_ok);
        let (tx_down, _rx_down) = mpsc::channel(8);
        let down = mgr.register_connection("n-down", tx_down);
        down.state.lock().status = NodeHealth::Down;

        let delivered = mgr.broadcast_command(&restart_cmd());
        assert_eq!(delivered, 1);
        assert!(rx_ok.try_recv().is_ok());
        assert!(mgr.last_broadcast_error().expect("recorded").contains("n-down"));
    }

    #[test]
    fn classify_all_reports_transitions_once() {
        let mgr = NodeManager::new();
        let (tx, _rx) = mpsc::channel(1);
        mgr.register_connection("n-1", tx);
        let thresholds = HealthThresholds::default();

        let later = Utc::now() + ChronoDuration::seconds(45);
        let transitions = mgr.classify_all(later, &thresholds);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, NodeHealth::Degraded);

        // Same pass again: status already Degraded, no new transition.
        assert!(mgr.classify_all(later, &thresholds).is_empty());

        let much_later = Utc::now() + ChronoDuration::seconds(120);
        let transitions = mgr.classify_all(much_later, &thresholds);
        assert_eq!(transitions[0].to, NodeHealth::Down);
    }
}
