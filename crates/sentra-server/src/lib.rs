use std::sync::Arc;

use sentra_connectors::ConnectorRegistry;
use sentra_core::{EngineConfig, EventBus, Orchestrator};
use sentra_evidence::SqliteStore;

mod http;

pub use http::{router, serve};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: Arc<SqliteStore>,
    pub bus: EventBus,
    pub registry: ConnectorRegistry,
    pub config: EngineConfig,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: EngineConfig) -> Self {
        let store = orchestrator.store();
        let bus = orchestrator.bus();
        let registry = orchestrator.registry();
        Self {
            orchestrator,
            store,
            bus,
            registry,
            config,
        }
    }
}
