//! RPC method handlers and frame dispatch.
//!
//! Every method except `health.check` requires a valid bearer token; the
//! resolved principal is threaded through for audit logging. Handlers are
//! plain async functions over [`SharedState`] so they are testable without
//! a socket.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use strata_auth::Principal;
use strata_deploy::{RollbackError, rollback, rollback_to_latest_successful};
use strata_node::NodeConnection;
use strata_proto::{
    DeploymentCommand, HealthCheckResponse, HeartbeatRequest, HeartbeatResponse, LogEntry,
    NodeAgentConfig, NodeHealth, PushLogsResponse, RegisterRequest, RegisterResponse,
    RequestFrame, ResponseFrame, RpcCode, ServingStatus, StatusReport, StatusResponse,
    WatchCommandsRequest, methods,
};
use strata_store::{DeploymentStatus, LogRecord, NodeRecord, StoreError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SharedState;

/// Per-socket context: the outbound command channel and, once
/// `watch_commands` ran, the node registration it created.
pub struct ConnContext {
    pub cmd_tx: mpsc::Sender<DeploymentCommand>,
    pub registration: Option<Arc<NodeConnection>>,
    /// Cumulative valid log entries received on this stream.
    pub logs_received: u64,
}

impl ConnContext {
    pub fn new(cmd_tx: mpsc::Sender<DeploymentCommand>) -> Self {
        Self {
            cmd_tx,
            registration: None,
            logs_received: 0,
        }
    }
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

/// Route one request frame to its handler.
pub async fn dispatch(
    state: &SharedState,
    ctx: &mut ConnContext,
    frame: RequestFrame,
) -> ResponseFrame {
    // health.watch answers with the current status like health.check;
    // clients re-poll for changes.
    if frame.method == methods::HEALTH_CHECK || frame.method == methods::HEALTH_WATCH {
        return health_check(state, &frame);
    }

    let Some(principal) = authenticate(state, &frame) else {
        return ResponseFrame::err(
            &frame.id,
            RpcCode::Unauthenticated,
            "missing or invalid bearer token",
        );
    };
    debug!(method = %frame.method, principal = %principal.name, "dispatching");

    match frame.method.as_str() {
        methods::REGISTER => register(state, &frame),
        methods::HEARTBEAT => heartbeat(state, &frame),
        methods::WATCH_COMMANDS => watch_commands(state, ctx, &frame),
        methods::REPORT_STATUS => report_status(state, &frame),
        methods::PUSH_LOGS => push_logs(state, ctx, &frame),
        methods::FLEET_STATUS => fleet_status(state, &frame),
        methods::SERVICE_ROLLBACK => service_rollback(state, &frame, &principal),
        other => ResponseFrame::err(
            &frame.id,
            RpcCode::InvalidArgument,
            format!("unknown method: {other}"),
        ),
    }
}

/// Resolve the caller. The frame's authorization field is authoritative;
/// `register` may instead carry the token in its request body (a worker's
/// first call).
fn authenticate(state: &SharedState, frame: &RequestFrame) -> Option<Principal> {
    let mut tokens = state.tokens.lock();
    if let Some(token) = frame.bearer_token() {
        return tokens.validate(token);
    }
    if frame.method == methods::REGISTER {
        let body_token = frame
            .params
            .as_ref()
            .and_then(|p| p.get("auth_token"))
            .and_then(|t| t.as_str())?;
        return tokens.validate(body_token);
    }
    None
}

fn parse_params<T: for<'de> Deserialize<'de>>(frame: &RequestFrame) -> Result<T, ResponseFrame> {
    let params = frame.params.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(params).map_err(|e| {
        ResponseFrame::err(
            &frame.id,
            RpcCode::InvalidArgument,
            format!("invalid params: {e}"),
        )
    })
}

fn ok<T: Serialize>(frame: &RequestFrame, body: &T) -> ResponseFrame {
    ResponseFrame::ok(&frame.id, body)
}

// ─── Methods ──────────────────────────────────────────────────────────────────

fn health_check(state: &SharedState, frame: &RequestFrame) -> ResponseFrame {
    let status = if state.is_serving() {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    };
    ok(frame, &HealthCheckResponse { status })
}

fn register(state: &SharedState, frame: &RequestFrame) -> ResponseFrame {
    let request: RegisterRequest = match parse_params(frame) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Err(e) = request.node_info.validate() {
        return ResponseFrame::err(&frame.id, RpcCode::InvalidArgument, e.to_string());
    }

    let info = request.node_info;
    let node_id = info
        .node_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("n-{}", Uuid::new_v4().simple()));
    let now = Utc::now();
    // A re-registration keeps its original registered_at; everything else
    // resets to the fresh advertisement.
    let registered_at = state
        .store
        .get_node(&node_id)
        .map(|n| n.registered_at)
        .unwrap_or(now);

    state.store.upsert_node(NodeRecord {
        id: node_id.clone(),
        hostname: info.hostname,
        address: info.address,
        grpc_port: info.grpc_port,
        resources: info.resources,
        cached_paths: info.cached_paths,
        healthy: true,
        draining: false,
        last_heartbeat: now,
        registered_at,
    });
    info!(node_id = %node_id, "node registered");

    ok(
        frame,
        &RegisterResponse {
            success: true,
            node_id,
            message: "registered".to_string(),
            config: NodeAgentConfig::default(),
        },
    )
}

fn heartbeat(state: &SharedState, frame: &RequestFrame) -> ResponseFrame {
    let request: HeartbeatRequest = match parse_params(frame) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let resources = request.node_info.as_ref().map(|i| &i.resources);
    let cached_paths = request.node_info.as_ref().map(|i| i.cached_paths.as_slice());
    if let Err(e) =
        state
            .store
            .update_node_heartbeat(&request.node_id, resources, cached_paths, Utc::now())
    {
        return ResponseFrame::err(&frame.id, RpcCode::NotFound, e.to_string());
    }

    // The connection may not exist yet (heartbeat before watch_commands);
    // that is not an error.
    let _ = state
        .nodes
        .update_heartbeat(&request.node_id, request.draining);
    if let Some(draining) = request.draining {
        if let Err(e) = state.store.set_node_draining(&request.node_id, draining) {
            warn!(node_id = %request.node_id, error = %e, "failed to persist draining flag");
        }
    }

    ok(frame, &HeartbeatResponse { success: true })
}

fn watch_commands(
    state: &SharedState,
    ctx: &mut ConnContext,
    frame: &RequestFrame,
) -> ResponseFrame {
    let request: WatchCommandsRequest = match parse_params(frame) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if state.store.get_node(&request.node_id).is_none() {
        return ResponseFrame::err(
            &frame.id,
            RpcCode::NotFound,
            format!("node {} is not registered", request.node_id),
        );
    }

    // Re-subscribing on the same socket drops the previous registration.
    if let Some(previous) = ctx.registration.take() {
        state.nodes.unregister_exact(&previous);
    }
    let conn = state
        .nodes
        .register_connection(&request.node_id, ctx.cmd_tx.clone());
    ctx.registration = Some(conn);
    info!(node_id = %request.node_id, "command watch established");

    ok(frame, &json!({ "subscribed": true }))
}

fn report_status(state: &SharedState, frame: &RequestFrame) -> ResponseFrame {
    let report: StatusReport = match parse_params(frame) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let Some(target) = DeploymentStatus::from_reported(report.status) else {
        return ResponseFrame::err(
            &frame.id,
            RpcCode::InvalidArgument,
            format!("status {} is not reportable", report.status),
        );
    };
    let Some(current) = state.store.get_deployment(report.deployment_id) else {
        return ResponseFrame::err(
            &frame.id,
            RpcCode::NotFound,
            format!("deployment {} not found", report.deployment_id),
        );
    };

    if let Some(container_id) = &report.container_id {
        debug!(
            deployment_id = %report.deployment_id,
            container_id = %container_id,
            status = %report.status,
            "status report"
        );
    }

    // Repeated reports of the current state acknowledge without a
    // transition (workers re-send on reconnect).
    if current.status != target {
        let result = state.store.with_tx(|tx| {
            if target == DeploymentStatus::Running {
                let record = tx.deployment_mut(report.deployment_id)?;
                if record.started_at.is_none() {
                    record.started_at = report.started_at;
                }
            }
            tx.transition(report.deployment_id, target)?;
            let record = tx.deployment_mut(report.deployment_id)?;
            if report.error_message.is_some() {
                record.error_message = report.error_message.clone();
            }
            if report.exit_code.is_some() {
                record.exit_code = report.exit_code;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                info!(
                    deployment_id = %report.deployment_id,
                    from = %current.status,
                    to = %target,
                    "deployment status updated"
                );
            }
            Err(e @ StoreError::InvalidTransition { .. }) => {
                return ResponseFrame::err(&frame.id, RpcCode::FailedPrecondition, e.to_string());
            }
            Err(e) => {
                return ResponseFrame::err(&frame.id, RpcCode::Internal, e.to_string());
            }
        }
    }

    if target.is_terminal() {
        state
            .nodes
            .mark_deployment_complete(&report.node_id, report.deployment_id);
    }

    ok(frame, &StatusResponse { acknowledged: true })
}

#[derive(Debug, Deserialize)]
struct PushLogsBatch {
    entries: Vec<LogEntry>,
}

fn push_logs(state: &SharedState, ctx: &mut ConnContext, frame: &RequestFrame) -> ResponseFrame {
    let batch: PushLogsBatch = match parse_params(frame) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    for entry in batch.entries {
        let Some(deployment_id) = entry.deployment_id else {
            warn!("dropping log entry without deployment_id");
            continue;
        };
        state.store.append_log(LogRecord {
            id: Uuid::new_v4(),
            deployment_id,
            source: entry.stream_id,
            level: entry.level,
            message: entry.message,
            timestamp: entry.timestamp,
        });
        ctx.logs_received += 1;
    }

    ok(
        frame,
        &PushLogsResponse {
            entries_received: ctx.logs_received,
        },
    )
}

fn fleet_status(state: &SharedState, frame: &RequestFrame) -> ResponseFrame {
    let nodes = state.store.list_nodes();
    let statuses = state.nodes.connection_statuses();
    let count = |wanted: NodeHealth| statuses.iter().filter(|(_, h, _)| *h == wanted).count();

    ok(
        frame,
        &json!({
            "total": nodes.len(),
            "connected": statuses.len(),
            "healthy": state.nodes.healthy_nodes().len(),
            "degraded": count(NodeHealth::Degraded),
            "down": count(NodeHealth::Down),
            "draining": nodes.iter().filter(|n| n.draining).count(),
            "generated_at": Utc::now(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct RollbackParams {
    app_id: String,
    service_name: String,
    #[serde(default)]
    target_deployment_id: Option<Uuid>,
}

fn service_rollback(
    state: &SharedState,
    frame: &RequestFrame,
    principal: &Principal,
) -> ResponseFrame {
    let params: RollbackParams = match parse_params(frame) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let result = match params.target_deployment_id {
        Some(target) => rollback(&state.store, &params.app_id, &params.service_name, target),
        None => rollback_to_latest_successful(&state.store, &params.app_id, &params.service_name),
    };

    match result {
        Ok(created) => {
            info!(
                app_id = %params.app_id,
                service = %params.service_name,
                version = created.version,
                issued_by = %principal.name,
                "rollback accepted"
            );
            ok(
                frame,
                &json!({
                    "deployment_id": created.id,
                    "version": created.version,
                    "status": created.status,
                }),
            )
        }
        Err(e @ RollbackError::DeploymentNotFound(_)) => {
            ResponseFrame::err(&frame.id, RpcCode::NotFound, e.to_string())
        }
        Err(e @ (RollbackError::NoArtifact(_) | RollbackError::NoPreviousDeployment { .. })) => {
            ResponseFrame::err(&frame.id, RpcCode::FailedPrecondition, e.to_string())
        }
        Err(e) => ResponseFrame::err(&frame.id, RpcCode::Internal, e.to_string()),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
