//! Deterministic simulated connectors.
//!
//! Results are derived purely from the queried entities so tests and local
//! runs are reproducible. Failure injection drives registry, breaker, and
//! engine failure-policy tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sentra_types::{ConnectorDefinition, ErrorKind, HealthReport};
use serde_json::{json, Map, Value};

use crate::{CallOpts, Connector, ConnectorError};

#[derive(Debug, Clone)]
pub struct SimProfile {
    /// Artificial per-call latency; zero keeps test clocks tame.
    pub latency: Duration,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct FailScript {
    kind: Option<ErrorKind>,
    remaining: u32,
}

/// In-memory stand-in for an external data source.
pub struct SimConnector {
    connector_type: String,
    profile: SimProfile,
    fail_script: Mutex<FailScript>,
    unhealthy: AtomicBool,
}

impl SimConnector {
    pub fn new(connector_type: String, profile: SimProfile) -> Self {
        Self {
            connector_type,
            profile,
            fail_script: Mutex::new(FailScript::default()),
            unhealthy: AtomicBool::new(false),
        }
    }

    /// Inject `count` consecutive failures of the given kind.
    pub fn fail_next(&self, kind: ErrorKind, count: u32) {
        let mut script = self.fail_script.lock().unwrap_or_else(|e| e.into_inner());
        script.kind = Some(kind);
        script.remaining = count;
    }

    /// Toggle the health probe outcome.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::Relaxed);
    }

    fn take_scripted_failure(&self) -> Option<ConnectorError> {
        let mut script = self.fail_script.lock().unwrap_or_else(|e| e.into_inner());
        if script.remaining == 0 {
            return None;
        }
        script.remaining -= 1;
        let kind = script.kind.unwrap_or(ErrorKind::Server5xx);
        Some(match kind {
            ErrorKind::RateLimit => ConnectorError::rate_limited(250),
            other => ConnectorError::new(other, "injected failure"),
        })
    }

    fn entities_of<'a>(payload: &'a Value, key: &str) -> Vec<&'a str> {
        payload
            .get("entities")
            .and_then(|e| e.get(key))
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|i| i.as_str()).collect())
            .unwrap_or_default()
    }

    fn siem_records(payload: &Value) -> Vec<Value> {
        let mut records = Vec::new();
        let ts = Utc::now();
        let ips = Self::entities_of(payload, "ip");
        let users = Self::entities_of(payload, "user");
        let hosts = Self::entities_of(payload, "host");

        for (i, ip) in ips.iter().enumerate() {
            let peer = ips.get(i + 1).copied().unwrap_or("10.0.0.1");
            records.push(json!({
                "event_type": "netflow",
                "src_ip": ip,
                "dst_ip": peer,
                "bytes_out": 4_096 + (i as u64) * 512,
                "protocol": "tcp",
                "timestamp": ts,
            }));
            records.push(json!({
                "event_type": "authentication",
                "src_ip": ip,
                "user": users.first().copied().unwrap_or("unknown"),
                "outcome": "success",
                "timestamp": ts,
            }));
        }
        for host in hosts {
            records.push(json!({
                "event_type": "host_activity",
                "hostname": host,
                "log_source": "syslog",
                "timestamp": ts,
            }));
        }
        if records.is_empty() {
            records.push(json!({
                "event_type": "search",
                "matches": 0,
                "timestamp": ts,
            }));
        }
        records
    }

    fn edr_records(payload: &Value) -> Vec<Value> {
        let mut records = Vec::new();
        let ts = Utc::now();
        let hashes = Self::entities_of(payload, "hash");
        let hosts = Self::entities_of(payload, "host");
        let processes = Self::entities_of(payload, "process");

        for process in &processes {
            records.push(json!({
                "event_type": "process_start",
                "process": process,
                "hostname": hosts.first().copied().unwrap_or("ws-unknown"),
                "command_line": format!("{process} -enc <redacted>"),
                "timestamp": ts,
            }));
        }
        for hash in &hashes {
            records.push(json!({
                "event_type": "file_observed",
                "file_hash": hash,
                "path": "C:/Users/Public/payload.bin",
                "hostname": hosts.first().copied().unwrap_or("ws-unknown"),
                "timestamp": ts,
            }));
        }
        if records.is_empty() {
            records.push(json!({
                "event_type": "telemetry_sweep",
                "matches": 0,
                "timestamp": ts,
            }));
        }
        records
    }

    fn intel_records(payload: &Value) -> Vec<Value> {
        let mut records = Vec::new();
        for (kind, key) in [("domain", "domain"), ("hash", "hash"), ("ip", "ip")] {
            for value in Self::entities_of(payload, key) {
                records.push(Self::reputation(value, kind));
            }
        }
        records
    }

    /// Deterministic reputation derived from the observable itself.
    fn reputation(value: &str, kind: &str) -> Value {
        let digest: u32 = value
            .bytes()
            .fold(0x811c_9dc5_u32, |acc, b| {
                (acc ^ u32::from(b)).wrapping_mul(0x0100_0193)
            });
        let marker_bad = value.contains("suspicious")
            || value.contains("malware")
            || value.contains("abc123");
        let score = if marker_bad {
            0.92
        } else {
            f64::from(digest % 80) / 100.0
        };
        let techniques: Vec<&str> = match kind {
            "hash" => vec!["T1204", "T1027"],
            "domain" => vec!["T1071", "T1566"],
            "ip" => vec!["T1071"],
            _ => vec![],
        };
        json!({
            "indicator": value,
            "kind": kind,
            "reputation": score,
            "malicious": score >= 0.8,
            "mitre_techniques": techniques,
            "sources": ["sim-intel-feed"],
        })
    }

    async fn simulate(&self, opts: &CallOpts) -> Result<(), ConnectorError> {
        if opts.cancel.is_cancelled() {
            return Err(ConnectorError::timeout("call cancelled"));
        }
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        if !self.profile.latency.is_zero() {
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(ConnectorError::timeout("call cancelled")),
                _ = tokio::time::sleep(self.profile.latency) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for SimConnector {
    fn connector_type(&self) -> &str {
        &self.connector_type
    }

    async fn initialize(&self, _definition: &ConnectorDefinition) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthReport, ConnectorError> {
        if self.unhealthy.load(Ordering::Relaxed) {
            return Ok(HealthReport {
                healthy: false,
                latency_ms: 0,
                detail: Some("simulated outage".to_string()),
            });
        }
        Ok(HealthReport {
            healthy: true,
            latency_ms: 3,
            detail: None,
        })
    }

    async fn query(&self, payload: &Value, opts: &CallOpts) -> Result<Value, ConnectorError> {
        self.simulate(opts).await?;
        let records = match self.connector_type.as_str() {
            super::SIEM => Self::siem_records(payload),
            super::EDR => Self::edr_records(payload),
            super::THREAT_INTEL => Self::intel_records(payload),
            _ => Vec::new(),
        };
        let mut result = Map::new();
        result.insert("source".to_string(), json!(self.connector_type));
        result.insert("records".to_string(), json!(records));
        if let Some(query) = payload.get("query") {
            result.insert("query".to_string(), query.clone());
        }
        Ok(Value::Object(result))
    }

    async fn enrich(
        &self,
        value: &str,
        kind: &str,
        opts: &CallOpts,
    ) -> Result<Value, ConnectorError> {
        self.simulate(opts).await?;
        Ok(Self::reputation(value, kind))
    }

    fn capabilities(&self) -> Vec<String> {
        match self.connector_type.as_str() {
            super::THREAT_INTEL => vec!["query".to_string(), "enrich".to_string()],
            _ => vec!["query".to_string()],
        }
    }

    fn data_types(&self) -> Vec<String> {
        match self.connector_type.as_str() {
            super::SIEM => vec!["log".to_string(), "network".to_string()],
            super::EDR => vec!["process".to_string(), "file".to_string()],
            super::THREAT_INTEL => vec!["enrichment".to_string()],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({
            "query": "alert pivot",
            "entities": {
                "ip": ["192.168.1.100", "10.0.0.5"],
                "hash": ["abc123def456"],
                "domain": ["suspicious.com"],
                "process": ["powershell.exe"],
                "user": ["svc-admin"],
            }
        })
    }

    #[tokio::test]
    async fn siem_emits_records_for_each_ip() {
        let sim = SimConnector::new(super::super::SIEM.to_string(), SimProfile::default());
        let result = sim.query(&payload(), &CallOpts::default()).await.unwrap();
        let records = result["records"].as_array().unwrap();
        assert!(records.len() >= 4);
        assert!(records.iter().any(|r| r["event_type"] == "netflow"));
        assert!(records.iter().any(|r| r["event_type"] == "authentication"));
    }

    #[tokio::test]
    async fn intel_reputation_is_deterministic() {
        let sim = SimConnector::new(super::super::THREAT_INTEL.to_string(), SimProfile::default());
        let a = sim
            .enrich("suspicious.com", "domain", &CallOpts::default())
            .await
            .unwrap();
        let b = sim
            .enrich("suspicious.com", "domain", &CallOpts::default())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a["malicious"], true);
    }

    #[tokio::test]
    async fn scripted_failures_drain() {
        let sim = SimConnector::new(super::super::SIEM.to_string(), SimProfile::default());
        sim.fail_next(ErrorKind::NetworkTransient, 2);
        assert!(sim.query(&payload(), &CallOpts::default()).await.is_err());
        assert!(sim.query(&payload(), &CallOpts::default()).await.is_err());
        assert!(sim.query(&payload(), &CallOpts::default()).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_call_is_rejected() {
        let sim = SimConnector::new(super::super::SIEM.to_string(), SimProfile::default());
        let opts = CallOpts::default();
        opts.cancel.cancel();
        let err = sim.query(&payload(), &opts).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
