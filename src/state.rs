//! Shared server state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::command::{ConnectionRegistry, Dispatcher};
use crate::config::Config;
use crate::store::{NodeStore, ScanStore};

#[derive(Clone)]
pub struct ServerState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Live command channels, one per connected node.
    pub registry: ConnectionRegistry,
    pub dispatcher: Dispatcher,
    pub nodes: NodeStore,
    pub scans: ScanStore,
    /// Root of every tunnel's cancellation; cancelled on shutdown.
    pub shutdown: CancellationToken,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), config.server.dispatch_settings());
        let scans = ScanStore::with_retention(config.server.scan_retention);
        Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            nodes: NodeStore::new(),
            scans,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }
}
