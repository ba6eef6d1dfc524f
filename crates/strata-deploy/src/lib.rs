//! Zero-downtime deployment for the Strata control plane.
//!
//! The [`Deployer`] drives a blue-green cutover: start the new container,
//! gate on its health probe, flip routing, retire the old container. A
//! failed gate or routing flip stops the new container and leaves the old
//! one serving — traffic never cuts over to an unhealthy replica.
//!
//! Container and routing operations go through trait seams; the daemon
//! wires in implementations that drive worker agents and the reverse
//! proxy.

#![forbid(unsafe_code)]

pub mod env;
pub mod http;
pub mod rollback;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use strata_proto::HealthCheckSpec;
use strata_store::{DeploymentRecord, NodeRecord};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

pub use env::merge_env;
pub use http::HttpRoutingUpdater;
pub use rollback::{RollbackError, rollback, rollback_to_latest_successful};

// ─── Trait seams ──────────────────────────────────────────────────────────────

/// Container operations on a worker node.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn start_container(
        &self,
        node: &NodeRecord,
        name: &str,
        deployment: &DeploymentRecord,
    ) -> Result<()>;

    async fn stop_container(&self, node: &NodeRecord, name: &str) -> Result<()>;

    /// One probe attempt. `Ok(false)` is "not healthy yet"; errors are
    /// treated the same way by the gate.
    async fn check_health(
        &self,
        node: &NodeRecord,
        name: &str,
        health_check: &HealthCheckSpec,
    ) -> Result<bool>;
}

/// Flips the reverse-proxy upstream for a service. Returns the previous
/// container name (empty when the service had no upstream).
#[async_trait]
pub trait RoutingUpdater: Send + Sync {
    async fn update_routing(&self, service: &str, new_container: &str, port: u16)
    -> Result<String>;
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("failed to start container {container}: {message}")]
    StartFailed { container: String, message: String },
    #[error("container {container} failed its health gate")]
    HealthCheckFailed { container: String },
    #[error("routing update for {service} failed: {message}")]
    RoutingUpdateFailed { service: String, message: String },
}

// ─── Deployer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Delay between health probe attempts.
    pub health_interval: Duration,
    /// Total time the new container has to become healthy.
    pub health_timeout: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// What a successful cutover did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoverReport {
    pub new_container: String,
    /// Previous upstream, when the service had one.
    pub old_container: Option<String>,
    pub old_stopped: bool,
}

pub struct Deployer {
    containers: Arc<dyn ContainerManager>,
    routing: Arc<dyn RoutingUpdater>,
    config: DeployerConfig,
}

impl Deployer {
    pub fn new(
        containers: Arc<dyn ContainerManager>,
        routing: Arc<dyn RoutingUpdater>,
        config: DeployerConfig,
    ) -> Self {
        Self {
            containers,
            routing,
            config,
        }
    }

    /// Blue-green cutover of `deployment` on `node`.
    pub async fn deploy(
        &self,
        node: &NodeRecord,
        deployment: &DeploymentRecord,
        app_name: &str,
    ) -> Result<CutoverReport, DeployError> {
        let new_container = deployment.container_name(app_name);
        info!(
            deployment_id = %deployment.id,
            container = %new_container,
            node_id = %node.id,
            "starting blue-green cutover"
        );

        self.containers
            .start_container(node, &new_container, deployment)
            .await
            .map_err(|e| DeployError::StartFailed {
                container: new_container.clone(),
                message: e.to_string(),
            })?;

        let health_check = effective_health_check(deployment);
        if !self.await_healthy(node, &new_container, &health_check).await {
            warn!(container = %new_container, "health gate failed, stopping new container");
            self.stop_best_effort(node, &new_container).await;
            return Err(DeployError::HealthCheckFailed {
                container: new_container,
            });
        }

        let port = service_port(deployment, &health_check);
        let old_container = match self
            .routing
            .update_routing(&deployment.service_name, &new_container, port)
            .await
        {
            Ok(old) => old,
            Err(e) => {
                warn!(
                    service = %deployment.service_name,
                    error = %e,
                    "routing update failed, stopping new container"
                );
                self.stop_best_effort(node, &new_container).await;
                return Err(DeployError::RoutingUpdateFailed {
                    service: deployment.service_name.clone(),
                    message: e.to_string(),
                });
            }
        };

        // Traffic is on the new container; retiring the old one is
        // best-effort and never fails the deployment.
        let mut old_stopped = false;
        if !old_container.is_empty() && deployment.version > 1 {
            match self.containers.stop_container(node, &old_container).await {
                Ok(()) => old_stopped = true,
                Err(e) => {
                    warn!(container = %old_container, error = %e, "failed to stop old container");
                }
            }
        }

        info!(
            deployment_id = %deployment.id,
            new = %new_container,
            old = %old_container,
            "cutover complete"
        );
        Ok(CutoverReport {
            new_container,
            old_container: (!old_container.is_empty()).then_some(old_container),
            old_stopped,
        })
    }

    /// Poll the health probe until it passes or the gate times out.
    async fn await_healthy(
        &self,
        node: &NodeRecord,
        container: &str,
        health_check: &HealthCheckSpec,
    ) -> bool {
        let deadline = Instant::now() + self.config.health_timeout;
        loop {
            match self.containers.check_health(node, container, health_check).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(container, error = %e, "health probe errored");
                }
            }
            if Instant::now() + self.config.health_interval > deadline {
                return false;
            }
            sleep(self.config.health_interval).await;
        }
    }

    async fn stop_best_effort(&self, node: &NodeRecord, container: &str) {
        if let Err(e) = self.containers.stop_container(node, container).await {
            warn!(container, error = %e, "best-effort stop failed");
        }
    }
}

/// The probe to gate on: the deployment's own, or a conventional default
/// against its first published port.
fn effective_health_check(deployment: &DeploymentRecord) -> HealthCheckSpec {
    deployment
        .config
        .health_check
        .clone()
        .unwrap_or_else(|| HealthCheckSpec {
            path: "/healthz".to_string(),
            port: deployment.config.ports.first().copied().unwrap_or(80),
            interval_s: 5,
            timeout_s: 3,
        })
}

fn service_port(deployment: &DeploymentRecord, health_check: &HealthCheckSpec) -> u16 {
    deployment
        .config
        .ports
        .first()
        .copied()
        .unwrap_or(health_check.port)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
