pub mod breaker;
pub mod builtin;
pub mod error;
pub mod limiter;
pub mod managed;
pub mod registry;

pub use breaker::*;
pub use error::*;
pub use limiter::*;
pub use managed::*;
pub use registry::*;

use std::time::Duration;

use async_trait::async_trait;
use sentra_types::{ConnectorDefinition, HealthReport};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-call execution constraints. Every connector call receives a deadline
/// and a cancellation token and must honor both.
#[derive(Debug, Clone)]
pub struct CallOpts {
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl CallOpts {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(deadline: Duration, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }
}

impl Default for CallOpts {
    fn default() -> Self {
        Self::new(Duration::from_millis(5_000))
    }
}

/// Typed adapter to an external data source.
///
/// Implementations are variant-unaware plumbing; the registry is the only
/// site that knows which concrete types exist.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector type tag, e.g. `siem`, `edr`, `threat_intel`.
    fn connector_type(&self) -> &str;

    /// Apply configuration before first use. Called once by the registry.
    async fn initialize(&self, definition: &ConnectorDefinition) -> Result<(), ConnectorError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<HealthReport, ConnectorError>;

    /// Execute a typed query against the data source.
    async fn query(&self, payload: &Value, opts: &CallOpts) -> Result<Value, ConnectorError>;

    /// Enrich one observable (ip, domain, hash, …) with source context.
    async fn enrich(
        &self,
        value: &str,
        kind: &str,
        opts: &CallOpts,
    ) -> Result<Value, ConnectorError>;

    fn capabilities(&self) -> Vec<String>;

    fn data_types(&self) -> Vec<String>;

    async fn shutdown(&self) {}
}
