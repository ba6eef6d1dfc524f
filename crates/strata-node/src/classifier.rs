//! Periodic health classification from heartbeat freshness.
//!
//! Every `check_interval` the classifier recomputes each connection's
//! status from its heartbeat age, persists the node's `healthy` flag when
//! the classification changed, and hands nodes that fell to Down to the
//! reschedule hook.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use strata_proto::NodeHealth;
use strata_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::NodeManager;

/// Heartbeat-age thresholds. Invariant: `degraded_after < down_after`.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub check_interval: Duration,
    pub degraded_after: Duration,
    pub down_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            degraded_after: Duration::from_secs(30),
            down_after: Duration::from_secs(60),
        }
    }
}

/// Pure classification of a heartbeat age.
pub fn classify(elapsed: Duration, thresholds: &HealthThresholds) -> NodeHealth {
    if elapsed >= thresholds.down_after {
        NodeHealth::Down
    } else if elapsed >= thresholds.degraded_after {
        NodeHealth::Degraded
    } else {
        NodeHealth::Healthy
    }
}

/// The classifier loop. Runs until the shutdown signal flips.
pub struct HealthClassifier {
    manager: Arc<NodeManager>,
    store: Arc<Store>,
    thresholds: HealthThresholds,
    /// Nodes that transitioned into Down, for the scheduler to re-place.
    reschedule_tx: mpsc::Sender<String>,
}

impl HealthClassifier {
    pub fn new(
        manager: Arc<NodeManager>,
        store: Arc<Store>,
        thresholds: HealthThresholds,
        reschedule_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            manager,
            store,
            thresholds,
            reschedule_tx,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.thresholds.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass().await,
                _ = shutdown.changed() => {
                    info!("health classifier stopping");
                    return;
                }
            }
        }
    }

    /// One classification pass over every connection.
    pub async fn pass(&self) {
        let transitions = self.manager.classify_all(Utc::now(), &self.thresholds);
        for t in transitions {
            info!(node_id = %t.node_id, from = %t.from, to = %t.to, "node health changed");
            let healthy = t.to == NodeHealth::Healthy;
            if let Err(e) = self.store.update_node_health(&t.node_id, healthy) {
                warn!(node_id = %t.node_id, error = %e, "failed to persist health flag");
            }
            if t.to == NodeHealth::Down {
                if let Err(e) = self.reschedule_tx.send(t.node_id.clone()).await {
                    warn!(node_id = %t.node_id, error = %e, "reschedule hook unavailable");
                }
            }
        }
    }
}
