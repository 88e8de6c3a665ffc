use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sentra_types::{ConnectorDefinition, ConnectorMetrics, ConnectorStatus, ErrorKind};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::limiter::RateLimiter;
use crate::{CallOpts, Connector, ConnectorError};

/// Out-of-band notifications from the connector layer; the registry forwards
/// them to its broadcast channel.
#[derive(Debug, Clone)]
pub enum ConnectorNotice {
    BreakerStateChange {
        tenant_id: String,
        connector_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    HealthChanged {
        tenant_id: String,
        connector_id: String,
        status: ConnectorStatus,
    },
}

#[derive(Debug, Default)]
struct MetricsAccum {
    total_queries: u64,
    errors: u64,
    total_latency_ms: u64,
    rate_limit_hits: u64,
}

/// One connector instance wrapped with its serialization points: rate
/// limiter, circuit breaker, in-flight accounting, and rolling metrics.
/// Shared across investigations of the owning tenant.
pub struct ManagedConnector {
    definition: ConnectorDefinition,
    connector: Arc<dyn Connector>,
    // Guarded by std mutexes: no await happens while either lock is held.
    limiter: Mutex<RateLimiter>,
    breaker: Mutex<CircuitBreaker>,
    in_flight: AtomicUsize,
    status: Mutex<ConnectorStatus>,
    consecutive_health_failures: AtomicUsize,
    metrics: Mutex<MetricsAccum>,
    notices: mpsc::UnboundedSender<ConnectorNotice>,
}

impl ManagedConnector {
    pub fn new(
        definition: ConnectorDefinition,
        connector: Arc<dyn Connector>,
        breaker_config: BreakerConfig,
        notices: mpsc::UnboundedSender<ConnectorNotice>,
    ) -> Self {
        let now = Instant::now();
        let limiter = if definition.rate_limits.requests_per_second.is_none()
            && definition.rate_limits.requests_per_minute.is_none()
            && definition.rate_limits.requests_per_hour.is_none()
        {
            RateLimiter::unlimited(now)
        } else {
            RateLimiter::new(&definition.rate_limits, now)
        };
        Self {
            definition,
            connector,
            limiter: Mutex::new(limiter),
            breaker: Mutex::new(CircuitBreaker::new(breaker_config)),
            in_flight: AtomicUsize::new(0),
            status: Mutex::new(ConnectorStatus::Active),
            consecutive_health_failures: AtomicUsize::new(0),
            metrics: Mutex::new(MetricsAccum::default()),
            notices,
        }
    }

    pub fn definition(&self) -> &ConnectorDefinition {
        &self.definition
    }

    pub fn connector_id(&self) -> &str {
        &self.definition.connector_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.definition.tenant_id
    }

    pub fn connector_type(&self) -> &str {
        &self.definition.connector_type
    }

    pub fn priority(&self) -> u32 {
        self.definition.priority
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnectorStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.connector.capabilities()
    }

    pub fn data_types(&self) -> Vec<String> {
        self.connector.data_types()
    }

    pub fn metrics(&self) -> ConnectorMetrics {
        let accum = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let avg = if accum.total_queries > 0 {
            accum.total_latency_ms as f64 / accum.total_queries as f64
        } else {
            0.0
        };
        let error_rate = if accum.total_queries > 0 {
            accum.errors as f64 / accum.total_queries as f64
        } else {
            0.0
        };
        ConnectorMetrics {
            avg_latency_ms: avg,
            error_rate,
            total_queries: accum.total_queries,
            rate_limit_hits: accum.rate_limit_hits,
        }
    }

    pub async fn query(&self, payload: &Value, opts: &CallOpts) -> Result<Value, ConnectorError> {
        let connector = Arc::clone(&self.connector);
        let payload = payload.clone();
        let opts_clone = opts.clone();
        self.call(opts, move || async move {
            connector.query(&payload, &opts_clone).await
        })
        .await
    }

    pub async fn enrich(
        &self,
        value: &str,
        kind: &str,
        opts: &CallOpts,
    ) -> Result<Value, ConnectorError> {
        let connector = Arc::clone(&self.connector);
        let value = value.to_string();
        let kind = kind.to_string();
        let opts_clone = opts.clone();
        self.call(opts, move || async move {
            connector.enrich(&value, &kind, &opts_clone).await
        })
        .await
    }

    /// Probe health directly, bypassing limiter and breaker, and fold the
    /// outcome into the instance status. Returns the new status.
    pub async fn probe_health(&self, timeout: Duration) -> ConnectorStatus {
        let healthy = match tokio::time::timeout(timeout, self.connector.health_check()).await {
            Ok(Ok(report)) => report.healthy,
            Ok(Err(_)) | Err(_) => false,
        };

        let status = if healthy {
            self.consecutive_health_failures.store(0, Ordering::Relaxed);
            ConnectorStatus::Active
        } else {
            let failures = self
                .consecutive_health_failures
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            if failures >= 3 {
                ConnectorStatus::Unhealthy
            } else {
                ConnectorStatus::Degraded
            }
        };

        let changed = {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            let _ = self.notices.send(ConnectorNotice::HealthChanged {
                tenant_id: self.definition.tenant_id.clone(),
                connector_id: self.definition.connector_id.clone(),
                status,
            });
            tracing::info!(
                connector_id = %self.definition.connector_id,
                status = status.as_str(),
                "connector health changed"
            );
        }
        status
    }

    /// Release the underlying connector's resources.
    pub async fn shutdown(&self) {
        self.connector.shutdown().await;
    }

    /// Force the breaker back to Closed (operator action).
    pub fn reset_breaker(&self) {
        let change = {
            let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            breaker.reset()
        };
        self.publish_breaker_change(change);
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state()
    }

    async fn call<F, Fut>(&self, opts: &CallOpts, f: F) -> Result<Value, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, ConnectorError>>,
    {
        let now = Instant::now();

        // Limiter first: a rate-limited request must not consume the single
        // HalfOpen probe slot.
        {
            let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
            let decision = limiter.check_request(now);
            if !decision.allowed {
                drop(limiter);
                self.metrics
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .rate_limit_hits += 1;
                // A limiter rejection is load shedding, not connector fault;
                // it does not feed the breaker.
                return Err(ConnectorError::rate_limited(decision.retry_after_ms));
            }
        }

        let acquired = {
            let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            breaker.try_acquire(now)
        };
        match acquired {
            Ok(change) => self.publish_breaker_change(change),
            Err(()) => {
                return Err(ConnectorError::circuit_open(&self.definition.connector_id));
            }
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = tokio::select! {
            _ = opts.cancel.cancelled() => Err(ConnectorError::timeout("call cancelled")),
            outcome = tokio::time::timeout(opts.deadline, f()) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(ConnectorError::timeout(format!(
                    "connector {} exceeded {}ms deadline",
                    self.definition.connector_id,
                    opts.deadline.as_millis()
                ))),
            },
        };
        let elapsed = started.elapsed();
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        {
            let mut accum = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            accum.total_queries += 1;
            accum.total_latency_ms += elapsed.as_millis() as u64;
            if result.is_err() {
                accum.errors += 1;
            }
        }

        let after = Instant::now();
        let change = {
            let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            match &result {
                Ok(_) => breaker.record_success(after),
                // Validation and throttle responses mean the peer answered;
                // the connector itself is healthy.
                Err(err)
                    if matches!(err.kind, ErrorKind::Validation | ErrorKind::RateLimit) =>
                {
                    breaker.record_success(after)
                }
                Err(_) => breaker.record_failure(after),
            }
        };
        self.publish_breaker_change(change);

        result
    }

    fn publish_breaker_change(&self, change: Option<crate::breaker::StateChange>) {
        if let Some(change) = change {
            let _ = self.notices.send(ConnectorNotice::BreakerStateChange {
                tenant_id: self.definition.tenant_id.clone(),
                connector_id: self.definition.connector_id.clone(),
                from: change.from,
                to: change.to,
            });
        }
    }
}
