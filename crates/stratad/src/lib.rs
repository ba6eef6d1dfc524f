//! stratad — Strata control-plane daemon.
//!
//! Hosts the worker gateway (register / heartbeat / command watch / status
//! / logs over WebSocket frames), the scheduler and classifier loops, the
//! blue-green cutover driver, and the shutdown coordinator.

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod shutdown;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_auth::TokenStore;
use strata_node::NodeManager;
use strata_store::Store;

pub use config::DaemonConfig;

/// Shared daemon state — passed by reference into every handler.
pub struct SharedState {
    pub config: DaemonConfig,
    pub store: Arc<Store>,
    pub nodes: Arc<NodeManager>,
    pub tokens: Mutex<TokenStore>,
    serving: AtomicBool,
}

impl SharedState {
    pub fn new(
        config: DaemonConfig,
        store: Arc<Store>,
        nodes: Arc<NodeManager>,
        tokens: TokenStore,
    ) -> Self {
        Self {
            config,
            store,
            nodes,
            tokens: Mutex::new(tokens),
            serving: AtomicBool::new(true),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Flipped at the start of shutdown so health checks report
    /// NOT_SERVING while streams drain.
    pub fn stop_serving(&self) {
        self.serving.store(false, Ordering::SeqCst);
    }
}
