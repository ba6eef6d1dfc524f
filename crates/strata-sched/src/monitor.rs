//! The periodic loops that feed the scheduler.
//!
//! Three independent tasks, each ending only on the shutdown signal:
//! a fast poll over Built deployments, the stale-node sweep / backlog
//! processor, and the listener for the classifier's Down transitions.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use strata_store::{DeploymentStatus, Store};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::Scheduler;

/// Fast poll loop: try to place every Built deployment.
pub async fn run_poll_loop(
    scheduler: Arc<Scheduler>,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(scheduler.config().poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for deployment in store.list_by_status(DeploymentStatus::Built) {
                    match scheduler.schedule_and_assign(&deployment).await {
                        Ok(_) => {}
                        Err(e) if e.leaves_queued() => {
                            debug!(deployment_id = %deployment.id, outcome = %e, "deployment stays queued");
                        }
                        Err(e) => {
                            warn!(deployment_id = %deployment.id, error = %e, "placement failed");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("scheduler poll loop stopping");
                return;
            }
        }
    }
}

/// Stale-node sweep and backlog processor.
///
/// Nodes whose persisted heartbeat is older than the scheduler's health
/// threshold flip to unhealthy and have their deployments rescheduled.
/// Built deployments older than the backlog timeout are failed; the rest
/// get another placement attempt.
pub struct HealthMonitor {
    scheduler: Arc<Scheduler>,
    store: Arc<Store>,
}

impl HealthMonitor {
    pub fn new(scheduler: Arc<Scheduler>, store: Arc<Store>) -> Self {
        Self { scheduler, store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scheduler.config().check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass().await,
                _ = shutdown.changed() => {
                    info!("health monitor stopping");
                    return;
                }
            }
        }
    }

    /// One sweep. Public so tests can drive it without timers.
    pub async fn pass(&self) {
        let now = Utc::now();
        let threshold = ChronoDuration::from_std(self.scheduler.config().health_threshold)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));

        for node in self.store.list_nodes() {
            if node.healthy && now - node.last_heartbeat > threshold {
                info!(node_id = %node.id, "node heartbeat stale, marking unhealthy");
                if let Err(e) = self.store.update_node_health(&node.id, false) {
                    warn!(node_id = %node.id, error = %e, "failed to mark node unhealthy");
                    continue;
                }
                let report = self.scheduler.reschedule(&node.id).await;
                info!(
                    node_id = %node.id,
                    rescheduled = report.rescheduled,
                    failed = report.failed,
                    "stale node drained"
                );
            }
        }

        let timeout = ChronoDuration::from_std(self.scheduler.config().deployment_timeout)
            .unwrap_or_else(|_| ChronoDuration::minutes(30));
        for deployment in self.store.list_by_status(DeploymentStatus::Built) {
            if now - deployment.created_at > timeout {
                warn!(
                    deployment_id = %deployment.id,
                    age_secs = (now - deployment.created_at).num_seconds(),
                    "deployment exceeded backlog timeout, failing"
                );
                let result = self.store.with_tx(|state| {
                    state.transition(deployment.id, DeploymentStatus::Failed)?;
                    state.deployment_mut(deployment.id)?.error_message =
                        Some("deployment timed out waiting for placement".to_string());
                    Ok(())
                });
                if let Err(e) = result {
                    warn!(deployment_id = %deployment.id, error = %e, "failed to expire deployment");
                }
                continue;
            }
            match self.scheduler.schedule_and_assign(&deployment).await {
                Ok(_) => {}
                Err(e) if e.leaves_queued() => {
                    debug!(deployment_id = %deployment.id, outcome = %e, "deployment stays queued");
                }
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "backlog placement failed");
                }
            }
        }
    }
}

/// Consume the classifier's Down transitions and reschedule each node.
pub async fn run_reschedule_listener(
    scheduler: Arc<Scheduler>,
    mut rx: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            node_id = rx.recv() => {
                let Some(node_id) = node_id else {
                    info!("reschedule channel closed");
                    return;
                };
                info!(node_id = %node_id, "node down, rescheduling its deployments");
                scheduler.reschedule(&node_id).await;
            }
            _ = shutdown.changed() => {
                info!("reschedule listener stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Scheduler, SchedulerConfig};
    use std::time::Duration;
    use strata_node::NodeManager;
    use strata_proto::{BuildType, NodeResources, ServiceConfig};
    use strata_store::{DeploymentRecord, NodeRecord};
    use uuid::Uuid;

    fn node(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            hostname: format!("host-{id}"),
            address: "10.0.0.1".to_string(),
            grpc_port: 7443,
            resources: NodeResources {
                cpu_total: 16.0,
                cpu_available: 16.0,
                mem_total: 64 << 30,
                mem_available: 64 << 30,
                disk_total: 500 << 30,
                disk_available: 500 << 30,
            },
            cached_paths: vec![],
            healthy: true,
            draining: false,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    fn built(app: &str, service: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            app_id: app.to_string(),
            service_name: service.to_string(),
            version: 1,
            git_ref: "main".to_string(),
            git_commit: "deadbeef".to_string(),
            build_type: BuildType::Oci,
            artifact: format!("registry/{service}:1"),
            status: DeploymentStatus::Built,
            node_id: None,
            resource_spec: None,
            depends_on: vec![],
            config: ServiceConfig::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
            exit_code: None,
        }
    }

    fn monitor(store: Arc<Store>, nodes: Arc<NodeManager>) -> HealthMonitor {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            nodes,
            SchedulerConfig {
                retry_delay: Duration::ZERO,
                ..SchedulerConfig::default()
            },
        ));
        HealthMonitor::new(scheduler, store)
    }

    #[tokio::test]
    async fn stale_node_is_marked_unhealthy_and_drained() {
        let store = Arc::new(Store::in_memory());
        let mut stale = node("n-stale");
        stale.last_heartbeat = Utc::now() - ChronoDuration::seconds(90);
        store.upsert_node(stale);
        store.upsert_node(node("n-alive"));

        let nodes = Arc::new(NodeManager::new());
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        nodes.register_connection("n-alive", tx);

        let mut d = built("a", "api");
        d.status = DeploymentStatus::Running;
        d.node_id = Some("n-stale".to_string());
        d.started_at = Some(Utc::now());
        store.insert_deployment(d.clone());

        monitor(store.clone(), nodes).pass().await;

        assert!(!store.get_node("n-stale").unwrap().healthy);
        let moved = store.get_deployment(d.id).unwrap();
        assert_eq!(moved.node_id.as_deref(), Some("n-alive"));
        assert!(rx.try_recv().is_ok(), "deploy command re-emitted");
    }

    #[tokio::test]
    async fn expired_backlog_deployment_fails() {
        let store = Arc::new(Store::in_memory());
        let mut d = built("a", "api");
        d.created_at = Utc::now() - ChronoDuration::minutes(45);
        store.insert_deployment(d.clone());

        monitor(store.clone(), Arc::new(NodeManager::new())).pass().await;

        let expired = store.get_deployment(d.id).unwrap();
        assert_eq!(expired.status, DeploymentStatus::Failed);
        assert!(expired.finished_at.is_some());
        assert!(expired
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn queued_outcomes_leave_deployment_built() {
        // No nodes at all: placement yields NoHealthyNodes, which must not
        // fail the deployment.
        let store = Arc::new(Store::in_memory());
        let d = built("a", "api");
        store.insert_deployment(d.clone());

        monitor(store.clone(), Arc::new(NodeManager::new())).pass().await;
        assert_eq!(
            store.get_deployment(d.id).unwrap().status,
            DeploymentStatus::Built
        );
    }
}
