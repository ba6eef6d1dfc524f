//! Persisted entities and the deployment state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_proto::{BuildType, NodeResources, ReportedStatus, ServiceConfig};
use uuid::Uuid;

// ─── Node record ──────────────────────────────────────────────────────────────

/// Persisted registration of a worker node. Created by Register, mutated by
/// Heartbeat and the health classifier; removed only by operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub grpc_port: u16,
    pub resources: NodeResources,
    #[serde(default)]
    pub cached_paths: Vec<String>,
    pub healthy: bool,
    #[serde(default)]
    pub draining: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn has_cached(&self, artifact: &str) -> bool {
        self.cached_paths.iter().any(|p| p == artifact)
    }
}

// ─── Deployment status ────────────────────────────────────────────────────────

/// Control-plane deployment lifecycle. A superset of what workers report:
/// Building, Built, and Scheduled exist only on this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Built,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    /// Whether `self -> to` is an allowed lifecycle transition.
    ///
    /// Failed is reachable from every other state (node loss with no
    /// recoverable placement). The reschedule requeue edge back to Built is
    /// deliberately NOT here; see [`crate::Store::requeue_deployment`].
    pub fn can_transition(self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, to) {
            (Pending, Building) => true,
            (Building, Built) => true,
            (Built, Scheduled) => true,
            (Scheduled, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (from, Failed) => from != Failed,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Map a worker-reported status onto the lifecycle. `None` means the
    /// report is outside the accepted closed set (InvalidArgument).
    pub fn from_reported(status: ReportedStatus) -> Option<Self> {
        match status {
            // Pulling is the first on-node activity; the record moves to
            // Starting and stays there until the worker reports Running.
            ReportedStatus::Pulling | ReportedStatus::Starting => Some(Self::Starting),
            ReportedStatus::Running => Some(Self::Running),
            ReportedStatus::Stopping => Some(Self::Stopping),
            ReportedStatus::Stopped => Some(Self::Stopped),
            ReportedStatus::Failed => Some(Self::Failed),
            ReportedStatus::Unknown | ReportedStatus::Pending => None,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Built => "BUILT",
            Self::Scheduled => "SCHEDULED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

// ─── Service state ────────────────────────────────────────────────────────────

/// Operator-facing view derived from the latest deployment's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    New,
    Deploying,
    Running,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn from_latest(status: Option<DeploymentStatus>) -> Self {
        use DeploymentStatus::*;
        match status {
            None => Self::New,
            Some(Pending | Building | Built | Scheduled | Starting) => Self::Deploying,
            Some(Running) => Self::Running,
            Some(Stopping | Stopped) => Self::Stopped,
            Some(Failed) => Self::Failed,
        }
    }

    /// Actions an operator may take in this state.
    pub fn available_actions(self) -> &'static [ServiceAction] {
        use ServiceAction::*;
        match self {
            Self::New => &[Deploy],
            Self::Deploying => &[],
            Self::Running => &[Stop, Reload, Rebuild],
            Self::Stopped => &[Start, Rebuild],
            Self::Failed => &[Retry, Rebuild],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Deploy,
    Stop,
    Start,
    Reload,
    Rebuild,
    Retry,
}

// ─── Deployment record ────────────────────────────────────────────────────────

/// Requested compute for a deployment, in the operator's textual form.
/// Parsed by the scheduler at placement time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
}

/// Placement record for one version of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub app_id: String,
    pub service_name: String,
    /// Strictly increasing per {app_id, service_name}.
    pub version: i64,
    pub git_ref: String,
    pub git_commit: String,
    pub build_type: BuildType,
    /// Opaque artifact identifier produced by the builder. Empty until the
    /// build completes.
    pub artifact: String,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_spec: Option<ResourceSpec>,
    /// Services in the same app that must be Running before this one is
    /// placed, in order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: ServiceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl DeploymentRecord {
    /// Deterministic container name for blue-green cutover.
    pub fn container_name(&self, app_name: &str) -> String {
        format!("{app_name}-{}-v{}", self.service_name, self.version)
    }
}

// ─── Log record ───────────────────────────────────────────────────────────────

/// Persisted runtime/build log line. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub source: strata_proto::LogSource,
    pub level: strata_proto::LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
