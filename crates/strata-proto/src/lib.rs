//! Protocol types for the Strata node protocol.
//!
//! Defines the message types exchanged between the control plane and the
//! worker agents running on fleet nodes, plus the frame envelope the
//! WebSocket transport carries them in. Field names and enum spellings are
//! the wire contract; workers and the control plane are built against the
//! same definitions.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Status codes ─────────────────────────────────────────────────────────────

/// RPC status codes shared by every method response.
///
/// The retryable set drives the command retry policy: a sender may retry
/// `Unavailable` and `DeadlineExceeded`; everything else is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    Ok,
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Unavailable,
    DeadlineExceeded,
    FailedPrecondition,
    Internal,
}

impl RpcCode {
    /// Whether a command that failed with this code may be re-sent.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable | Self::DeadlineExceeded | Self::Internal)
    }
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            Self::Unauthenticated => write!(f, "UNAUTHENTICATED"),
            Self::PermissionDenied => write!(f, "PERMISSION_DENIED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            Self::FailedPrecondition => write!(f, "FAILED_PRECONDITION"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

// ─── Node health ──────────────────────────────────────────────────────────────

/// Liveness classification of a connected node, derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

// ─── Build type ───────────────────────────────────────────────────────────────

/// How the deployment artifact was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildType {
    #[default]
    Unknown,
    /// OCI container image.
    Oci,
    /// Nix store closure; eligible for cache-locality placement.
    Nix,
}

impl std::fmt::Display for BuildType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Oci => write!(f, "OCI"),
            Self::Nix => write!(f, "NIX"),
        }
    }
}

// ─── Node resources ───────────────────────────────────────────────────────────

/// Resource totals and availability a node advertises.
///
/// Updated atomically by Heartbeat. Memory and disk are bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeResources {
    pub cpu_total: f64,
    pub cpu_available: f64,
    pub mem_total: i64,
    pub mem_available: i64,
    pub disk_total: i64,
    pub disk_available: i64,
}

impl NodeResources {
    /// Validate the registration invariants: totals positive,
    /// `0 <= available <= total` for every dimension.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cpu_total <= 0.0 || self.mem_total <= 0 || self.disk_total <= 0 {
            return Err(ValidationError::Resources(
                "totals must be positive on registration".to_string(),
            ));
        }
        if self.cpu_available < 0.0 || self.cpu_available > self.cpu_total {
            return Err(ValidationError::Resources(format!(
                "cpu_available {} out of range 0..={}",
                self.cpu_available, self.cpu_total
            )));
        }
        if self.mem_available < 0 || self.mem_available > self.mem_total {
            return Err(ValidationError::Resources(format!(
                "mem_available {} out of range 0..={}",
                self.mem_available, self.mem_total
            )));
        }
        if self.disk_available < 0 || self.disk_available > self.disk_total {
            return Err(ValidationError::Resources(format!(
                "disk_available {} out of range 0..={}",
                self.disk_available, self.disk_total
            )));
        }
        Ok(())
    }
}

// ─── Node info ────────────────────────────────────────────────────────────────

/// Registration payload a worker sends when joining the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node id. Assigned by the control plane when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub hostname: String,
    pub address: String,
    pub grpc_port: u16,
    pub resources: NodeResources,
    /// Artifact store paths already present on the node.
    #[serde(default)]
    pub cached_paths: Vec<String>,
}

impl NodeInfo {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_hostname(&self.hostname)?;
        validate_address(&self.address)?;
        if self.grpc_port == 0 {
            return Err(ValidationError::Port(self.grpc_port));
        }
        self.resources.validate()
    }
}

/// Hostnames: non-empty, bounded, alphanumeric plus `-` `.` `_`.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(ValidationError::Hostname(hostname.to_string()));
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(ValidationError::Hostname(hostname.to_string()));
    }
    Ok(())
}

/// Addresses: non-empty, no whitespace. IP literal or DNS name.
pub fn validate_address(address: &str) -> Result<(), ValidationError> {
    if address.is_empty() || address.len() > 253 || address.chars().any(char::is_whitespace) {
        return Err(ValidationError::Address(address.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid hostname: {0:?}")]
    Hostname(String),
    #[error("invalid address: {0:?}")]
    Address(String),
    #[error("invalid port: {0} (expected 1..=65535)")]
    Port(u16),
    #[error("invalid resources: {0}")]
    Resources(String),
}

// ─── Register ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_info: NodeInfo,
    pub auth_token: String,
}

/// Per-node agent configuration handed back at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAgentConfig {
    pub heartbeat_interval_s: u32,
    pub max_concurrent_deployments: u32,
    pub log_buffer_size: u32,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 10,
            max_concurrent_deployments: 10,
            log_buffer_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub node_id: String,
    pub message: String,
    pub config: NodeAgentConfig,
}

// ─── Heartbeat ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    /// Refreshed resource metrics; omitted when unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,
    /// Worker-advertised drain request. The scheduler stops placing new
    /// deployments on a draining node; existing ones run to completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draining: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
}

// ─── Commands ─────────────────────────────────────────────────────────────────

/// Command kinds the control plane fans out to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Deploy,
    Stop,
    Restart,
    UpdateConfig,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploy => write!(f, "DEPLOY"),
            Self::Stop => write!(f, "STOP"),
            Self::Restart => write!(f, "RESTART"),
            Self::UpdateConfig => write!(f, "UPDATE_CONFIG"),
        }
    }
}

/// Service runtime configuration carried by a Deploy command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

/// Health probe the worker (and the cutover gate) runs against a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub path: String,
    pub port: u16,
    #[serde(default = "default_probe_interval_s")]
    pub interval_s: u32,
    #[serde(default = "default_probe_timeout_s")]
    pub timeout_s: u32,
}

fn default_probe_interval_s() -> u32 {
    5
}

fn default_probe_timeout_s() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployPayload {
    pub deployment_id: Uuid,
    pub app_id: String,
    pub service_name: String,
    pub version: i64,
    pub build_type: BuildType,
    pub artifact: String,
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPayload {
    pub deployment_id: Uuid,
    pub container_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPayload {
    pub deployment_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigPayload {
    pub deployment_id: Uuid,
    pub env_vars: HashMap<String, String>,
}

/// Tagged command payload. The tag is the wire-stable [`CommandType`]
/// spelling; consumers pattern-match on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPayload {
    Deploy(DeployPayload),
    Stop(StopPayload),
    Restart(RestartPayload),
    UpdateConfig(UpdateConfigPayload),
}

impl CommandPayload {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Deploy(_) => CommandType::Deploy,
            Self::Stop(_) => CommandType::Stop,
            Self::Restart(_) => CommandType::Restart,
            Self::UpdateConfig(_) => CommandType::UpdateConfig,
        }
    }

    /// The deployment this command concerns.
    pub fn deployment_id(&self) -> Uuid {
        match self {
            Self::Deploy(p) => p.deployment_id,
            Self::Stop(p) => p.deployment_id,
            Self::Restart(p) => p.deployment_id,
            Self::UpdateConfig(p) => p.deployment_id,
        }
    }
}

/// A command emitted to a worker. `command_id` is unique per emission;
/// the deadline is wall-clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCommand {
    pub command_id: Uuid,
    pub deadline: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchCommandsRequest {
    pub node_id: String,
}

// ─── Status reports ───────────────────────────────────────────────────────────

/// Deployment statuses a worker may report. Workers never observe the
/// control-plane-only states (Building, Built, Scheduled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    #[default]
    Unknown,
    Pending,
    Pulling,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Pending => write!(f, "PENDING"),
            Self::Pulling => write!(f, "PULLING"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: String,
    pub deployment_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    pub status: ReportedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub acknowledged: bool,
}

// ─── Logs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    #[default]
    Runtime,
    Build,
}

/// A single log line streamed from a worker. Entries without a
/// deployment id are dropped by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<Uuid>,
    #[serde(default)]
    pub stream_id: LogSource,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushLogsResponse {
    pub entries_received: u64,
}

// ─── Health service ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

// ─── Frame envelope ───────────────────────────────────────────────────────────

/// Method names the gateway dispatches on.
pub mod methods {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const WATCH_COMMANDS: &str = "watch_commands";
    pub const REPORT_STATUS: &str = "report_status";
    pub const PUSH_LOGS: &str = "push_logs";
    pub const HEALTH_CHECK: &str = "health.check";
    pub const HEALTH_WATCH: &str = "health.watch";
    pub const FLEET_STATUS: &str = "fleet.status";
    pub const SERVICE_ROLLBACK: &str = "service.rollback";
}

/// Event names pushed by the gateway.
pub mod events {
    pub const COMMAND: &str = "command";
}

/// A request frame from a worker or operator client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub frame_type: String, // always "req"
    pub id: String,
    pub method: String,
    /// Bearer token; absent only on `health.check`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(id: String, method: String, params: Option<serde_json::Value>) -> Self {
        Self {
            frame_type: "req".to_string(),
            id,
            method,
            authorization: None,
            params,
        }
    }

    pub fn with_bearer(mut self, token: &str) -> Self {
        self.authorization = Some(format!("Bearer {token}"));
        self
    }

    /// Extract the bearer token from the authorization field.
    pub fn bearer_token(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: RpcCode,
    pub message: String,
}

/// A response frame for a previously received request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok<T: Serialize>(id: &str, result: &T) -> Self {
        Self {
            id: id.to_string(),
            result: serde_json::to_value(result).ok(),
            error: None,
        }
    }

    pub fn err(id: &str, code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: None,
            error: Some(ErrorShape {
                code,
                message: message.into(),
            }),
        }
    }
}

/// An unsolicited server push (command fan-out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EventFrame {
    pub fn command(cmd: &DeploymentCommand) -> Self {
        Self {
            event: events::COMMAND.to_string(),
            payload: serde_json::to_value(cmd).ok(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn node_info() -> NodeInfo {
        NodeInfo {
            node_id: Some("n-abc123".to_string()),
            hostname: "worker-01".to_string(),
            address: "10.0.4.17".to_string(),
            grpc_port: 7443,
            resources: NodeResources {
                cpu_total: 8.0,
                cpu_available: 6.5,
                mem_total: 16 * (1 << 30),
                mem_available: 12 * (1 << 30),
                disk_total: 100 * (1 << 30),
                disk_available: 80 * (1 << 30),
            },
            cached_paths: vec!["/nix/store/abc-closure".to_string()],
        }
    }

    // ── Wire round-trips ──────────────────────────────────────────────────────

    #[test]
    fn register_request_round_trip() {
        let req = RegisterRequest {
            node_info: node_info(),
            auth_token: "tok-123".to_string(),
        };
        let json = serde_json::to_string(&req).expect("serialize");
        let back: RegisterRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(req, back);
    }

    #[test]
    fn register_response_round_trip() {
        let resp = RegisterResponse {
            success: true,
            node_id: "n-abc123".to_string(),
            message: "registered".to_string(),
            config: NodeAgentConfig::default(),
        };
        let json = serde_json::to_string(&resp).expect("serialize");
        let back: RegisterResponse = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(resp, back);
    }

    #[test]
    fn node_info_round_trip() {
        let info = node_info();
        let json = serde_json::to_string(&info).expect("serialize");
        let back: NodeInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(info, back);
    }

    #[test]
    fn status_report_round_trip() {
        let report = StatusReport {
            node_id: "n-abc123".to_string(),
            deployment_id: Uuid::new_v4(),
            command_id: Some(Uuid::new_v4()),
            status: ReportedStatus::Running,
            container_id: Some("app-api-v3".to_string()),
            exit_code: None,
            error_message: None,
            started_at: Some(Utc::now()),
        };
        let json = serde_json::to_string(&report).expect("serialize");
        let back: StatusReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(report, back);
    }

    #[test]
    fn deployment_command_round_trip_all_variants() {
        let variants = vec![
            CommandPayload::Deploy(DeployPayload {
                deployment_id: Uuid::new_v4(),
                app_id: "app-1".to_string(),
                service_name: "api".to_string(),
                version: 3,
                build_type: BuildType::Nix,
                artifact: "/nix/store/abc-closure".to_string(),
                config: ServiceConfig::default(),
            }),
            CommandPayload::Stop(StopPayload {
                deployment_id: Uuid::new_v4(),
                container_name: "app-api-v2".to_string(),
            }),
            CommandPayload::Restart(RestartPayload {
                deployment_id: Uuid::new_v4(),
            }),
            CommandPayload::UpdateConfig(UpdateConfigPayload {
                deployment_id: Uuid::new_v4(),
                env_vars: HashMap::from([("PORT".to_string(), "8080".to_string())]),
            }),
        ];
        for payload in variants {
            let cmd = DeploymentCommand {
                command_id: Uuid::new_v4(),
                deadline: Utc::now(),
                payload,
            };
            let json = serde_json::to_string(&cmd).expect("serialize");
            let back: DeploymentCommand = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(cmd, back);
        }
    }

    // ── Wire spellings ────────────────────────────────────────────────────────

    #[test]
    fn command_payload_tag_is_screaming_snake_case() {
        let cmd = DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: Utc::now(),
            payload: CommandPayload::UpdateConfig(UpdateConfigPayload {
                deployment_id: Uuid::new_v4(),
                env_vars: HashMap::new(),
            }),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"UPDATE_CONFIG""#), "got {json}");
    }

    #[test]
    fn build_type_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&BuildType::Oci).unwrap(), "\"OCI\"");
        assert_eq!(serde_json::to_string(&BuildType::Nix).unwrap(), "\"NIX\"");
    }

    #[test]
    fn reported_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&ReportedStatus::Pulling).unwrap(),
            "\"PULLING\""
        );
    }

    #[test]
    fn log_level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"warn\"");
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn node_info_validates() {
        assert!(node_info().validate().is_ok());
    }

    #[test]
    fn node_info_rejects_zero_port() {
        let mut info = node_info();
        info.grpc_port = 0;
        assert!(matches!(info.validate(), Err(ValidationError::Port(0))));
    }

    #[test]
    fn node_info_rejects_bad_hostname() {
        let mut info = node_info();
        info.hostname = "has space".to_string();
        assert!(matches!(info.validate(), Err(ValidationError::Hostname(_))));
        info.hostname = String::new();
        assert!(info.validate().is_err());
    }

    #[test]
    fn resources_reject_available_above_total() {
        let mut res = node_info().resources;
        res.cpu_available = res.cpu_total + 1.0;
        assert!(res.validate().is_err());
    }

    #[test]
    fn resources_reject_nonpositive_totals() {
        let mut res = node_info().resources;
        res.mem_total = 0;
        assert!(res.validate().is_err());
    }

    // ── Retry classification ─────────────────────────────────────────────────

    #[test]
    fn retryable_codes() {
        for code in [RpcCode::Unavailable, RpcCode::DeadlineExceeded, RpcCode::Internal] {
            assert!(code.is_retryable(), "{code} should be retryable");
        }
        for code in [
            RpcCode::InvalidArgument,
            RpcCode::NotFound,
            RpcCode::AlreadyExists,
            RpcCode::PermissionDenied,
            RpcCode::Unauthenticated,
        ] {
            assert!(!code.is_retryable(), "{code} should not be retryable");
        }
    }

    // ── Frame envelope ────────────────────────────────────────────────────────

    #[test]
    fn request_frame_bearer_token_extraction() {
        let frame = RequestFrame::new("r-1".to_string(), methods::HEARTBEAT.to_string(), None)
            .with_bearer("tok-abc");
        assert_eq!(frame.bearer_token(), Some("tok-abc"));

        let bare = RequestFrame::new("r-2".to_string(), methods::HEARTBEAT.to_string(), None);
        assert!(bare.bearer_token().is_none());
    }

    #[test]
    fn request_frame_rejects_malformed_authorization() {
        let mut frame = RequestFrame::new("r-3".to_string(), methods::REGISTER.to_string(), None);
        frame.authorization = Some("Basic abc".to_string());
        assert!(frame.bearer_token().is_none());
        frame.authorization = Some("Bearer ".to_string());
        assert!(frame.bearer_token().is_none());
    }

    #[test]
    fn response_frame_ok_omits_error() {
        let resp = ResponseFrame::ok("r-1", &HeartbeatResponse { success: true });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""success":true"#));
        assert!(!json.contains("error"), "error must be omitted: {json}");
    }

    #[test]
    fn response_frame_err_omits_result() {
        let resp = ResponseFrame::err("r-2", RpcCode::NotFound, "node n-x not found");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("NOT_FOUND"));
        assert!(!json.contains("result"), "result must be omitted: {json}");
    }

    #[test]
    fn event_frame_wraps_command() {
        let cmd = DeploymentCommand {
            command_id: Uuid::new_v4(),
            deadline: Utc::now(),
            payload: CommandPayload::Restart(RestartPayload {
                deployment_id: Uuid::new_v4(),
            }),
        };
        let frame = EventFrame::command(&cmd);
        assert_eq!(frame.event, "command");
        let payload = frame.payload.expect("payload");
        assert_eq!(payload["type"], "RESTART");
    }

    #[test]
    fn log_entry_default_fields() {
        let raw = r#"{"message":"hello","timestamp":"2026-07-01T10:00:00Z"}"#;
        let entry: LogEntry = serde_json::from_str(raw).expect("deserialize");
        assert!(entry.deployment_id.is_none());
        assert_eq!(entry.stream_id, LogSource::Runtime);
        assert_eq!(entry.level, LogLevel::Info);
    }
}
