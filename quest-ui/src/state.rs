//! Shared application state for the API server.

use std::sync::Arc;

use quest::session::{InstanceView, Orchestrator};
use tokio::sync::broadcast;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// An instance published a new view (after a poll or while one starts).
    InstanceChanged { view: Box<InstanceView> },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Broadcast sender for instance changes.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            orchestrator: Arc::new(orchestrator),
            event_tx: Arc::new(event_tx),
        }
    }
}
