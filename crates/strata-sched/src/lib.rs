//! Placement scheduling for the Strata control plane.
//!
//! [`Scheduler::schedule`] is a pure function over the current node set;
//! [`Scheduler::schedule_and_assign`] also persists the placement and emits
//! the Deploy command through the node manager, applying the bounded retry
//! policy. The periodic loops that feed the scheduler live in [`monitor`].

#![forbid(unsafe_code)]

pub mod monitor;
pub mod resources;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use strata_node::{NodeManager, SendError};
use strata_proto::{
    BuildType, CommandPayload, DeployPayload, DeploymentCommand, RpcCode,
};
use strata_store::{DeploymentRecord, DeploymentStatus, NodeRecord, Store, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use resources::{ResourceRequest, ResourceSpecError, request_from_spec};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// No node passed the liveness filter.
    #[error("no healthy nodes available")]
    NoHealthyNodes,
    /// Nodes are alive but none fits the resource request.
    #[error("insufficient resources on all healthy nodes")]
    InsufficientResources,
    /// A declared dependency's latest deployment is not Running.
    #[error("dependency {0:?} is not running")]
    DependenciesNotRunning(String),
    #[error(transparent)]
    InvalidResourceSpec(#[from] ResourceSpecError),
    /// The Deploy command could not be delivered within the retry budget;
    /// the deployment has been marked Failed.
    #[error("command dispatch to node {node_id} failed: {code}")]
    DispatchFailed { node_id: String, code: RpcCode },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScheduleError {
    /// Outcomes that leave the deployment queued in Built. The backlog
    /// processor retries these on every tick until success or timeout.
    pub fn leaves_queued(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyNodes | Self::InsufficientResources | Self::DependenciesNotRunning(_)
        )
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// A node's heartbeat must be newer than this for placement.
    pub health_threshold: Duration,
    /// Wall-clock deadline attached to every outbound command.
    pub command_timeout: Duration,
    /// Send attempts per command before the deployment fails.
    pub max_retries: u32,
    /// Pause between send attempts. Deadlines are the primary safety;
    /// this only spaces the attempts out.
    pub retry_delay: Duration,
    /// Built deployments older than this are failed by the backlog
    /// processor.
    pub deployment_timeout: Duration,
    /// Tick of the Built-deployment poll loop.
    pub poll_interval: Duration,
    /// Tick of the stale-node sweep / backlog processor.
    pub check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_threshold: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(250),
            deployment_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(2),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome counts of a node reschedule, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescheduleReport {
    pub attempted: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    store: Arc<Store>,
    nodes: Arc<NodeManager>,
    config: SchedulerConfig,
}

/// Capacity score used as the placement tie-break: normalized free CPU
/// weighted against normalized free memory.
fn capacity_score(node: &NodeRecord) -> f64 {
    let cpu = node.resources.cpu_available / 64.0;
    let mem = (node.resources.mem_available as f64 / (256.0 * (1u64 << 30) as f64)) / 2.0;
    cpu + mem
}

impl Scheduler {
    pub fn new(store: Arc<Store>, nodes: Arc<NodeManager>, config: SchedulerConfig) -> Self {
        Self {
            store,
            nodes,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Select a node for `deployment` without mutating anything.
    ///
    /// Filter pipeline, in order: liveness (healthy, fresh heartbeat, not
    /// draining), capacity, dependency ordering, Nix cache preference,
    /// capacity-score argmax with deterministic ties by node id.
    pub fn schedule(&self, deployment: &DeploymentRecord) -> Result<NodeRecord, ScheduleError> {
        let request = request_from_spec(deployment.resource_spec.as_ref())?;
        let now = Utc::now();
        let freshness_floor = now
            - ChronoDuration::from_std(self.config.health_threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));

        // list_nodes returns id-sorted records, which makes every
        // tie-break below reproducible.
        let live: Vec<NodeRecord> = self
            .store
            .list_nodes()
            .into_iter()
            .filter(|n| n.healthy && n.last_heartbeat > freshness_floor && !n.draining)
            .collect();
        if live.is_empty() {
            return Err(ScheduleError::NoHealthyNodes);
        }

        let fitting: Vec<NodeRecord> = live
            .into_iter()
            .filter(|n| {
                n.resources.cpu_available >= request.cpu
                    && n.resources.mem_available >= request.memory_bytes
            })
            .collect();
        if fitting.is_empty() {
            return Err(ScheduleError::InsufficientResources);
        }

        for dep in &deployment.depends_on {
            let running = self
                .store
                .latest_for_service(&deployment.app_id, dep)
                .is_some_and(|d| d.status == DeploymentStatus::Running);
            if !running {
                return Err(ScheduleError::DependenciesNotRunning(dep.clone()));
            }
        }

        // Nix closures deploy fastest where the artifact is already in the
        // store; prefer such a node over any capacity score.
        if deployment.build_type == BuildType::Nix && !deployment.artifact.is_empty() {
            if let Some(cached) = fitting.iter().find(|n| n.has_cached(&deployment.artifact)) {
                return Ok(cached.clone());
            }
        }

        let best = fitting
            .into_iter()
            .reduce(|best, candidate| {
                if capacity_score(&candidate) > capacity_score(&best) {
                    candidate
                } else {
                    best
                }
            })
            .expect("fitting is non-empty");
        Ok(best)
    }

    /// Select a node, persist the placement (Built → Scheduled plus the
    /// node assignment, atomically), and emit the Deploy command.
    pub async fn schedule_and_assign(
        &self,
        deployment: &DeploymentRecord,
    ) -> Result<String, ScheduleError> {
        let node = self.schedule(deployment)?;

        self.store.with_tx(|state| {
            state.deployment_mut(deployment.id)?.node_id = Some(node.id.clone());
            state.transition(deployment.id, DeploymentStatus::Scheduled)
        })?;

        info!(
            deployment_id = %deployment.id,
            app_id = %deployment.app_id,
            service = %deployment.service_name,
            version = deployment.version,
            node_id = %node.id,
            "deployment scheduled"
        );

        self.dispatch_deploy(&node.id, deployment).await?;
        Ok(node.id)
    }

    /// Emit the Deploy command with the bounded retry policy. A fresh
    /// command id and deadline are minted per attempt. `AlreadyExists`
    /// means a command for this deployment is already in flight and counts
    /// as success. Exhaustion or a non-retryable code fails the deployment.
    async fn dispatch_deploy(
        &self,
        node_id: &str,
        deployment: &DeploymentRecord,
    ) -> Result<(), ScheduleError> {
        let mut last: Option<SendError> = None;
        for attempt in 1..=self.config.max_retries {
            let cmd = self.deploy_command(deployment);
            match self.nodes.send_command(node_id, cmd) {
                Ok(()) => return Ok(()),
                Err(e) if e.code() == RpcCode::AlreadyExists => {
                    debug!(deployment_id = %deployment.id, node_id, "deploy already in flight");
                    return Ok(());
                }
                Err(e) if e.code().is_retryable() && attempt < self.config.max_retries => {
                    warn!(
                        deployment_id = %deployment.id,
                        node_id,
                        attempt,
                        error = %e,
                        "deploy command send failed, retrying"
                    );
                    last = Some(e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    last = Some(e);
                    break;
                }
            }
        }

        let code = last.map(|e| e.code()).unwrap_or(RpcCode::Unavailable);
        warn!(
            deployment_id = %deployment.id,
            node_id,
            code = %code,
            "deploy command dispatch exhausted, failing deployment"
        );
        let fail = self.store.with_tx(|state| {
            state.transition(deployment.id, DeploymentStatus::Failed)?;
            state.deployment_mut(deployment.id)?.error_message =
                Some(format!("deploy command dispatch to {node_id} failed: {code}"));
            Ok(())
        });
        if let Err(e) = fail {
            warn!(deployment_id = %deployment.id, error = %e, "failed to record dispatch failure");
        }
        Err(ScheduleError::DispatchFailed {
            node_id: node_id.to_string(),
            code,
        })
    }

    fn deploy_command(&self, deployment: &DeploymentRecord) -> DeploymentCommand {
        DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: Utc::now()
                + ChronoDuration::from_std(self.config.command_timeout)
                    .unwrap_or_else(|_| ChronoDuration::seconds(10)),
            payload: CommandPayload::Deploy(DeployPayload {
                deployment_id: deployment.id,
                app_id: deployment.app_id.clone(),
                service_name: deployment.service_name.clone(),
                version: deployment.version,
                build_type: deployment.build_type,
                artifact: deployment.artifact.clone(),
                config: deployment.config.clone(),
            }),
        }
    }

    /// Re-place every deployment assigned to a lost node. Each one is
    /// requeued to Built and run back through `schedule_and_assign`;
    /// queue-class outcomes leave it waiting for the backlog processor.
    pub async fn reschedule(&self, node_id: &str) -> RescheduleReport {
        let mut report = RescheduleReport::default();
        let assigned = self.store.list_by_node(node_id);
        for deployment in assigned {
            if !matches!(
                deployment.status,
                DeploymentStatus::Running | DeploymentStatus::Starting | DeploymentStatus::Scheduled
            ) {
                continue;
            }
            report.attempted += 1;

            let requeued = match self.store.requeue_deployment(deployment.id) {
                Ok(d) => d,
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "requeue failed");
                    report.failed += 1;
                    continue;
                }
            };
            // The lost node may come back with its active set intact; the
            // id must be re-sendable wherever it lands next.
            self.nodes.mark_deployment_complete(node_id, deployment.id);

            match self.schedule_and_assign(&requeued).await {
                Ok(new_node) => {
                    info!(
                        deployment_id = %deployment.id,
                        from = node_id,
                        to = %new_node,
                        "deployment rescheduled"
                    );
                    report.rescheduled += 1;
                }
                Err(e) if e.leaves_queued() => {
                    debug!(deployment_id = %deployment.id, outcome = %e, "reschedule queued");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "reschedule failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            node_id,
            attempted = report.attempted,
            rescheduled = report.rescheduled,
            failed = report.failed,
            "node reschedule complete"
        );
        report
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
