use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sentra_types::{ConnectorDefinition, ConnectorMetrics, ConnectorStatus, ErrorKind};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::breaker::BreakerConfig;
use crate::managed::{ConnectorNotice, ManagedConnector};
use crate::{CallOpts, Connector, ConnectorError};

/// Builds a connector instance from its durable definition.
pub type ConnectorFactory =
    Arc<dyn Fn(&ConnectorDefinition) -> anyhow::Result<Arc<dyn Connector>> + Send + Sync>;

/// One failover hop taken while serving a request.
#[derive(Debug, Clone)]
pub struct FailoverRecord {
    pub from_connector: String,
    pub to_connector: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of a routed call, annotated with the connector that served it and
/// any failover hops taken on the way. The caller turns the hops into
/// `connector_failover` events with run context attached.
#[derive(Debug, Clone)]
pub struct SourcedResult {
    pub connector_id: String,
    pub result: Value,
    pub failovers: Vec<FailoverRecord>,
}

/// Snapshot of a registered connector for listing surfaces.
#[derive(Debug, Clone)]
pub struct ConnectorSnapshot {
    pub definition: ConnectorDefinition,
    pub status: ConnectorStatus,
    pub metrics: ConnectorMetrics,
    pub capabilities: Vec<String>,
    pub data_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub breaker: BreakerConfig,
    pub health_probe_timeout: Duration,
    pub health_probe_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            health_probe_timeout: Duration::from_millis(2_000),
            health_probe_interval: Duration::from_millis(15_000),
        }
    }
}

/// Owns every connector instance, keyed by `(tenant_id, connector_id)`.
///
/// Routing policy per request typed by `(tenant, connector_type)`: healthy
/// instances ordered by priority, then least in-flight, round-robin on ties.
/// Retryable failures walk to the next candidate; unretryable failures
/// surface immediately.
#[derive(Clone)]
pub struct ConnectorRegistry {
    factories: Arc<RwLock<HashMap<String, ConnectorFactory>>>,
    instances: Arc<RwLock<HashMap<(String, String), Arc<ManagedConnector>>>>,
    rr_cursor: Arc<Mutex<HashMap<String, usize>>>,
    config: RegistryConfig,
    notice_tx: mpsc::UnboundedSender<ConnectorNotice>,
    broadcast_tx: broadcast::Sender<ConnectorNotice>,
}

impl ConnectorRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<ConnectorNotice>();
        let (broadcast_tx, _) = broadcast::channel(256);
        let forward = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                let _ = forward.send(notice);
            }
        });
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            rr_cursor: Arc::new(Mutex::new(HashMap::new())),
            config,
            notice_tx,
            broadcast_tx,
        }
    }

    /// Observe breaker transitions, health changes, and failovers.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<ConnectorNotice> {
        self.broadcast_tx.subscribe()
    }

    pub async fn register_factory(
        &self,
        connector_type: impl Into<String>,
        factory: ConnectorFactory,
    ) {
        self.factories
            .write()
            .await
            .insert(connector_type.into(), factory);
    }

    /// Instantiate and initialize a connector from its definition.
    pub async fn install(&self, definition: ConnectorDefinition) -> anyhow::Result<()> {
        let factory = {
            let factories = self.factories.read().await;
            factories.get(&definition.connector_type).cloned()
        };
        let Some(factory) = factory else {
            anyhow::bail!(
                "no factory registered for connector type {}",
                definition.connector_type
            );
        };
        let connector = factory(&definition)?;
        connector
            .initialize(&definition)
            .await
            .map_err(|err| anyhow::anyhow!("initialize {} failed: {err}", definition.connector_id))?;

        let key = (
            definition.tenant_id.clone(),
            definition.connector_id.clone(),
        );
        let managed = Arc::new(ManagedConnector::new(
            definition,
            connector,
            self.config.breaker.clone(),
            self.notice_tx.clone(),
        ));
        info!(
            connector_id = managed.connector_id(),
            connector_type = managed.connector_type(),
            tenant_id = managed.tenant_id(),
            "connector installed"
        );
        self.instances.write().await.insert(key, managed);
        Ok(())
    }

    pub async fn remove(&self, tenant_id: &str, connector_id: &str) -> bool {
        let key = (tenant_id.to_string(), connector_id.to_string());
        let removed = self.instances.write().await.remove(&key);
        match removed {
            Some(managed) => {
                managed.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, tenant_id: &str, connector_id: &str) -> Option<Arc<ManagedConnector>> {
        let key = (tenant_id.to_string(), connector_id.to_string());
        self.instances.read().await.get(&key).cloned()
    }

    pub async fn list(&self, tenant_id: &str) -> Vec<ConnectorSnapshot> {
        let instances = self.instances.read().await;
        let mut out: Vec<ConnectorSnapshot> = instances
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, managed)| ConnectorSnapshot {
                definition: managed.definition().clone(),
                status: managed.status(),
                metrics: managed.metrics(),
                capabilities: managed.capabilities(),
                data_types: managed.data_types(),
            })
            .collect();
        out.sort_by(|a, b| a.definition.connector_id.cmp(&b.definition.connector_id));
        out
    }

    /// Whether any non-unhealthy connector of the type exists for the tenant.
    pub async fn has_available(&self, tenant_id: &str, connector_type: &str) -> bool {
        !self.candidates(tenant_id, connector_type).await.is_empty()
    }

    /// Connector types with at least one non-unhealthy instance, sorted.
    pub async fn available_types(&self, tenant_id: &str) -> Vec<String> {
        let instances = self.instances.read().await;
        let mut types: Vec<String> = instances
            .iter()
            .filter(|((tenant, _), managed)| {
                tenant == tenant_id && managed.status() != ConnectorStatus::Unhealthy
            })
            .map(|(_, managed)| managed.connector_type().to_string())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub async fn query(
        &self,
        tenant_id: &str,
        connector_type: &str,
        payload: &Value,
        opts: &CallOpts,
    ) -> Result<SourcedResult, ConnectorError> {
        self.route(tenant_id, connector_type, opts, |managed, opts| {
            let payload = payload.clone();
            async move { managed.query(&payload, &opts).await }
        })
        .await
    }

    pub async fn enrich(
        &self,
        tenant_id: &str,
        connector_type: &str,
        value: &str,
        kind: &str,
        opts: &CallOpts,
    ) -> Result<SourcedResult, ConnectorError> {
        self.route(tenant_id, connector_type, opts, |managed, opts| {
            let value = value.to_string();
            let kind = kind.to_string();
            async move { managed.enrich(&value, &kind, &opts).await }
        })
        .await
    }

    async fn route<F, Fut>(
        &self,
        tenant_id: &str,
        connector_type: &str,
        opts: &CallOpts,
        mut op: F,
    ) -> Result<SourcedResult, ConnectorError>
    where
        F: FnMut(Arc<ManagedConnector>, CallOpts) -> Fut,
        Fut: std::future::Future<Output = Result<Value, ConnectorError>>,
    {
        let candidates = self.candidates(tenant_id, connector_type).await;
        if candidates.is_empty() {
            return Err(ConnectorError::no_connector(connector_type));
        }

        let mut failovers: Vec<FailoverRecord> = Vec::new();
        let mut last_err: Option<ConnectorError> = None;

        for (index, managed) in candidates.iter().enumerate() {
            if let Some(record) = failovers.last_mut() {
                record.to_connector = Some(managed.connector_id().to_string());
            }
            match op(Arc::clone(managed), opts.clone()).await {
                Ok(result) => {
                    return Ok(SourcedResult {
                        connector_id: managed.connector_id().to_string(),
                        result,
                        failovers,
                    });
                }
                Err(err) if err.kind.triggers_failover() && index + 1 < candidates.len() => {
                    warn!(
                        connector_id = managed.connector_id(),
                        kind = err.kind.as_str(),
                        "connector failed, failing over"
                    );
                    failovers.push(FailoverRecord {
                        from_connector: managed.connector_id().to_string(),
                        to_connector: None,
                        kind: err.kind,
                        message: err.message.clone(),
                    });
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| ConnectorError::no_connector(connector_type)))
    }

    /// Active-first candidate list: priority, then least-loaded, round-robin
    /// rotation among the equally-best heads on repeat calls.
    async fn candidates(
        &self,
        tenant_id: &str,
        connector_type: &str,
    ) -> Vec<Arc<ManagedConnector>> {
        let instances = self.instances.read().await;
        let mut list: Vec<Arc<ManagedConnector>> = instances
            .iter()
            .filter(|((tenant, _), managed)| {
                tenant == tenant_id
                    && managed.connector_type() == connector_type
                    && managed.status() != ConnectorStatus::Unhealthy
            })
            .map(|(_, managed)| Arc::clone(managed))
            .collect();
        drop(instances);

        list.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then(a.in_flight().cmp(&b.in_flight()))
                .then(a.connector_id().cmp(b.connector_id()))
        });

        // Rotate ties at the head so equal candidates share load.
        if list.len() > 1 {
            let head_priority = list[0].priority();
            let head_load = list[0].in_flight();
            let tie_count = list
                .iter()
                .take_while(|c| c.priority() == head_priority && c.in_flight() == head_load)
                .count();
            if tie_count > 1 {
                let cursor_key = format!("{tenant_id}:{connector_type}");
                let mut cursors = self.rr_cursor.lock().await;
                let cursor = cursors.entry(cursor_key).or_insert(0);
                let offset = *cursor % tie_count;
                *cursor = cursor.wrapping_add(1);
                list[..tie_count].rotate_left(offset);
            }
        }

        list
    }

    /// Probe every instance once. Called by the health monitor loop and by
    /// tests directly.
    pub async fn run_health_probes(&self) {
        let instances: Vec<Arc<ManagedConnector>> = {
            let map = self.instances.read().await;
            map.values().cloned().collect()
        };
        for managed in instances {
            managed.probe_health(self.config.health_probe_timeout).await;
        }
    }

    /// Background probe loop. Aborts with the returned handle.
    pub fn spawn_health_monitor(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let interval = registry.config.health_probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.run_health_probes().await;
            }
        })
    }
}
