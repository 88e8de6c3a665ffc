use serde::{Deserialize, Serialize};

/// Health classification maintained by the registry's probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Active,
    Degraded,
    Unhealthy,
}

impl ConnectorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectorStatus::Active => "active",
            ConnectorStatus::Degraded => "degraded",
            ConnectorStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Authentication scheme carried by a connector definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Basic,
    Oauth,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSpec {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    /// Opaque credential material; redacted before logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl Default for AuthSpec {
    fn default() -> Self {
        Self {
            auth_type: AuthType::None,
            credentials: None,
        }
    }
}

/// Rate windows a connector definition may configure. All configured windows
/// must simultaneously permit a request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(rename = "requestsPerSecond", skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<u32>,
    #[serde(rename = "requestsPerMinute", skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(rename = "requestsPerHour", skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u32>,
}

/// Durable connector definition owned by the registry, scoped to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    #[serde(rename = "connectorId")]
    pub connector_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Connector type, e.g. `siem`, `edr`, `threat_intel`.
    #[serde(rename = "type")]
    pub connector_type: String,
    /// Lower value = primary; failover walks upward.
    pub priority: u32,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(rename = "rateLimits", default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Rolling operational metrics for one connector instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorMetrics {
    #[serde(rename = "avgLatencyMs")]
    pub avg_latency_ms: f64,
    #[serde(rename = "errorRate")]
    pub error_rate: f64,
    #[serde(rename = "totalQueries")]
    pub total_queries: u64,
    #[serde(rename = "rateLimitHits")]
    pub rate_limit_hits: u64,
}

/// Health probe result returned by a connector implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(rename = "latencyMs")]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
