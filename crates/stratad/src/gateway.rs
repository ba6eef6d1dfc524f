//! The worker gateway — WebSocket transport for the node protocol.
//!
//! One task per socket owns both directions: request frames are dispatched
//! to handlers and answered in place, and commands routed to this node are
//! forwarded as event frames. Nothing else ever writes to the socket.
//! Cancellation (peer close, transport error, or daemon shutdown) is the
//! single exit path; it unregisters whatever connection the socket had
//! established.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::handlers::{ConnContext, dispatch};
use strata_proto::{EventFrame, RequestFrame, ResponseFrame, RpcCode};

/// Outbound command buffer per socket. A worker that stops draining its
/// stream gets send failures (surfaced as Unavailable) rather than
/// unbounded memory growth.
const COMMAND_BUFFER: usize = 64;

/// Accept loop. Each socket runs independently until it closes or the
/// shutdown signal flips.
pub async fn run_gateway(
    listener: TcpListener,
    state: Arc<SharedState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "gateway listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "worker connection accepted");
                        let state = state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(stream, state, shutdown).await {
                                debug!(%peer, error = %e, "socket closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("gateway stopping");
                return;
            }
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    state: Arc<SharedState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let mut ctx = ConnContext::new(cmd_tx);
    let mut commands_open = true;

    let exit = loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_text(&state, &mut ctx, &text).await;
                        let json = match serde_json::to_string(&response) {
                            Ok(json) => json,
                            Err(e) => {
                                error!(error = %e, "response serialization failed");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("worker closed connection");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e),
                }
            }

            command = cmd_rx.recv(), if commands_open => {
                let Some(command) = command else {
                    commands_open = false;
                    continue;
                };
                let frame = EventFrame::command(&command);
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            break Err(e);
                        }
                    }
                    Err(e) => error!(error = %e, "command serialization failed"),
                }
            }

            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    if let Some(conn) = ctx.registration.take() {
        state.nodes.unregister_exact(&conn);
    }
    exit
}

async fn handle_text(state: &SharedState, ctx: &mut ConnContext, text: &str) -> ResponseFrame {
    match serde_json::from_str::<RequestFrame>(text) {
        Ok(frame) => dispatch(state, ctx, frame).await,
        Err(e) => {
            warn!(error = %e, "malformed request frame");
            ResponseFrame::err("", RpcCode::InvalidArgument, format!("malformed frame: {e}"))
        }
    }
}
