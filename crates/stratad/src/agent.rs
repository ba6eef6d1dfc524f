//! Agent-facing implementations of the deployer seams, plus the cutover
//! driver.
//!
//! Containers are driven through the node's command channel: starting a
//! container emits a Deploy command (a duplicate in flight counts as
//! already started), stopping one emits a Stop command. Health probes go
//! straight to the container's published endpoint on the node.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strata_deploy::{ContainerManager, DeployError, Deployer};
use strata_node::{NodeManager, SendError};
use strata_proto::{
    CommandPayload, DeployPayload, DeploymentCommand, HealthCheckSpec, StopPayload,
};
use strata_store::{DeploymentRecord, DeploymentStatus, NodeRecord, Store};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Command-backed container manager ─────────────────────────────────────────

pub struct CommandContainerManager {
    nodes: Arc<NodeManager>,
    store: Arc<Store>,
    client: reqwest::Client,
    command_timeout: Duration,
}

impl CommandContainerManager {
    pub fn new(nodes: Arc<NodeManager>, store: Arc<Store>, command_timeout: Duration) -> Self {
        Self {
            nodes,
            store,
            client: reqwest::Client::new(),
            command_timeout,
        }
    }

    fn deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            + ChronoDuration::from_std(self.command_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(10))
    }
}

#[async_trait]
impl ContainerManager for CommandContainerManager {
    async fn start_container(
        &self,
        node: &NodeRecord,
        name: &str,
        deployment: &DeploymentRecord,
    ) -> Result<()> {
        let cmd = DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: self.deadline(),
            payload: CommandPayload::Deploy(DeployPayload {
                deployment_id: deployment.id,
                app_id: deployment.app_id.clone(),
                service_name: deployment.service_name.clone(),
                version: deployment.version,
                build_type: deployment.build_type,
                artifact: deployment.artifact.clone(),
                config: deployment.config.clone(),
            }),
        };
        match self.nodes.send_command(&node.id, cmd) {
            Ok(()) => Ok(()),
            // The scheduler's dispatch already put this deployment in
            // flight; the container is starting.
            Err(SendError::AlreadyExists(_)) => {
                debug!(container = name, "deploy already in flight");
                Ok(())
            }
            Err(e) => bail!("deploy command to {} failed: {e}", node.id),
        }
    }

    async fn stop_container(&self, node: &NodeRecord, name: &str) -> Result<()> {
        let deployment = self
            .store
            .list_by_node(&node.id)
            .into_iter()
            .find(|d| d.container_name(&d.app_id) == name)
            .with_context(|| format!("no deployment on {} owns container {name}", node.id))?;

        let cmd = DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: self.deadline(),
            payload: CommandPayload::Stop(StopPayload {
                deployment_id: deployment.id,
                container_name: name.to_string(),
            }),
        };
        self.nodes
            .send_command(&node.id, cmd)
            .map_err(|e| anyhow::anyhow!("stop command to {} failed: {e}", node.id))
    }

    async fn check_health(
        &self,
        node: &NodeRecord,
        name: &str,
        health_check: &HealthCheckSpec,
    ) -> Result<bool> {
        let url = format!(
            "http://{}:{}{}",
            node.address, health_check.port, health_check.path
        );
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(u64::from(health_check.timeout_s)))
            .send()
            .await;
        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            // Connection refused / timeout just means not up yet.
            Err(e) => {
                debug!(container = name, url, error = %e, "health probe unreachable");
                Ok(false)
            }
        }
    }
}

// ─── Cutover driver ───────────────────────────────────────────────────────────

/// Watches for freshly scheduled deployments and runs the blue-green gate
/// for each. A gate failure fails the deployment and frees its command
/// slot; success leaves the worker's status reports to complete the record.
pub struct CutoverDriver {
    store: Arc<Store>,
    nodes: Arc<NodeManager>,
    deployer: Arc<Deployer>,
    poll_interval: Duration,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl CutoverDriver {
    pub fn new(
        store: Arc<Store>,
        nodes: Arc<NodeManager>,
        deployer: Arc<Deployer>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            nodes,
            deployer,
            poll_interval,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.clone().pass(),
                _ = shutdown.changed() => {
                    info!("cutover driver stopping");
                    return;
                }
            }
        }
    }

    /// Launch a gate task for every assigned deployment not already being
    /// driven. Starting ones are included so gates resume after a restart.
    pub fn pass(self: Arc<Self>) {
        let mut candidates = self.store.list_by_status(DeploymentStatus::Scheduled);
        candidates.extend(self.store.list_by_status(DeploymentStatus::Starting));
        for deployment in candidates {
            if !self.in_flight.lock().insert(deployment.id) {
                continue;
            }
            let driver = self.clone();
            tokio::spawn(async move {
                driver.run_cutover(deployment).await;
            });
        }
    }

    async fn run_cutover(&self, deployment: DeploymentRecord) {
        let result = self.cutover(&deployment).await;
        if let Err(e) = result {
            warn!(deployment_id = %deployment.id, error = %e, "cutover failed");
            let fail = self.store.with_tx(|state| {
                state.transition(deployment.id, DeploymentStatus::Failed)?;
                state.deployment_mut(deployment.id)?.error_message = Some(e.to_string());
                Ok(())
            });
            if let Err(e) = fail {
                warn!(deployment_id = %deployment.id, error = %e, "failed to record cutover failure");
            }
            if let Some(node_id) = &deployment.node_id {
                self.nodes.mark_deployment_complete(node_id, deployment.id);
            }
        }
        self.in_flight.lock().remove(&deployment.id);
    }

    async fn cutover(&self, deployment: &DeploymentRecord) -> Result<(), DeployError> {
        let node_id = deployment.node_id.as_deref().unwrap_or_default();
        let Some(node) = self.store.get_node(node_id) else {
            return Err(DeployError::StartFailed {
                container: deployment.container_name(&deployment.app_id),
                message: format!("assigned node {node_id} not found"),
            });
        };

        let report = self
            .deployer
            .deploy(&node, deployment, &deployment.app_id)
            .await?;

        // Traffic is over; retire the displaced version's record. Its
        // worker will report Stopped once the Stop command lands.
        if report.old_stopped {
            if let Some(old_name) = &report.old_container {
                let old = self
                    .store
                    .list_for_service(&deployment.app_id, &deployment.service_name)
                    .into_iter()
                    .find(|d| {
                        d.status == DeploymentStatus::Running
                            && d.version < deployment.version
                            && &d.container_name(&d.app_id) == old_name
                    });
                if let Some(old) = old {
                    if let Err(e) = self
                        .store
                        .with_tx(|state| state.transition(old.id, DeploymentStatus::Stopping))
                    {
                        warn!(deployment_id = %old.id, error = %e, "failed to mark old version stopping");
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strata_proto::{BuildType, NodeResources, ServiceConfig};
    use tokio::sync::mpsc;

    fn node(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            hostname: format!("host-{id}"),
            address: "127.0.0.1".to_string(),
            grpc_port: 7443,
            resources: NodeResources {
                cpu_total: 8.0,
                cpu_available: 8.0,
                mem_total: 16 << 30,
                mem_available: 16 << 30,
                disk_total: 100 << 30,
                disk_available: 100 << 30,
            },
            cached_paths: vec![],
            healthy: true,
            draining: false,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    fn deployment(service: &str, version: i64, status: DeploymentStatus) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            app_id: "shop".to_string(),
            service_name: service.to_string(),
            version,
            git_ref: "main".to_string(),
            git_commit: "deadbeef".to_string(),
            build_type: BuildType::Oci,
            artifact: format!("registry/{service}:{version}"),
            status,
            node_id: Some("n-1".to_string()),
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

    #[tokio::test]
    async fn start_container_emits_deploy_and_tolerates_duplicate() {
        let nodes = Arc::new(NodeManager::new());
        let store = Arc::new(Store::in_memory());
        let (tx, mut rx) = mpsc::channel(8);
        nodes.register_connection("n-1", tx);

        let manager =
            CommandContainerManager::new(nodes.clone(), store, Duration::from_secs(10));
        let d = deployment("api", 2, DeploymentStatus::Scheduled);

        manager
            .start_container(&node("n-1"), "shop-api-v2", &d)
            .await
            .expect("start");
        let cmd = rx.try_recv().expect("deploy command");
        assert!(matches!(cmd.payload, CommandPayload::Deploy(_)));

        // Duplicate start while in flight is fine.
        manager
            .start_container(&node("n-1"), "shop-api-v2", &d)
            .await
            .expect("duplicate start tolerated");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_container_targets_owning_deployment() {
        let nodes = Arc::new(NodeManager::new());
        let store = Arc::new(Store::in_memory());
        let (tx, mut rx) = mpsc::channel(8);
        nodes.register_connection("n-1", tx);

        let mut old = deployment("api", 1, DeploymentStatus::Running);
        old.node_id = Some("n-1".to_string());
        store.insert_deployment(old.clone());

        let manager =
            CommandContainerManager::new(nodes, store.clone(), Duration::from_secs(10));
        manager
            .stop_container(&node("n-1"), "shop-api-v1")
            .await
            .expect("stop");

        let cmd = rx.try_recv().expect("stop command");
        match cmd.payload {
            CommandPayload::Stop(p) => {
                assert_eq!(p.deployment_id, old.id);
                assert_eq!(p.container_name, "shop-api-v1");
            }
            other => panic!("expected Stop, got {other:?}"),
        }

        // Unknown containers are an error, not a silent no-op.
        assert!(manager
            .stop_container(&node("n-1"), "shop-api-v9")
            .await
            .is_err());
    }
}
