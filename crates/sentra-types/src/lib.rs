pub mod connector;
pub mod error;
pub mod evidence;
pub mod feedback;
pub mod investigation;

pub use connector::*;
pub use error::*;
pub use evidence::*;
pub use feedback::*;
pub use investigation::*;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity map attached to alerts and evidence: entity kind → set of values.
///
/// Ordered containers keep serialization and correlation deterministic.
pub type EntityMap = BTreeMap<String, BTreeSet<String>>;

/// Request-scoped identity threaded through every orchestrator, store, and
/// connector call. No persisted row and no query escapes its `tenant_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

impl TenantContext {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// Alert severity as delivered by the upstream detection source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Numeric rank used for priority derivation; higher is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally-produced security event requiring investigation.
/// Immutable after ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "alertId")]
    pub alert_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub title: String,
    pub severity: Severity,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "rawPayload")]
    pub raw_payload: Value,
    #[serde(default)]
    pub entities: EntityMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_round_trips_through_str() {
        for sev in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            let parsed: Severity = sev.as_str().parse().unwrap();
            assert_eq!(parsed, sev);
        }
    }

    #[test]
    fn severity_rank_orders_urgency() {
        assert!(Severity::Critical.rank() > Severity::High.rank());
        assert!(Severity::High.rank() > Severity::Medium.rank());
        assert!(Severity::Medium.rank() > Severity::Low.rank());
    }
}
