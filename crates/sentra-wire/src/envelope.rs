use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire schema version stamped on every event.
pub const SCHEMA_VERSION: &str = "1";

/// One event on the run stream: a JSON-RPC-like envelope of
/// `{method, params}` where `params` always carries the run coordinates and a
/// strictly monotonic `sequence` assigned by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub method: String,
    pub params: EventParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventParams {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "turnId")]
    pub turn_id: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
    /// Strictly monotonically increasing per run, starting at 1. Zero means
    /// "not yet assigned"; the bus overwrites it on publish.
    pub sequence: i64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    /// Kind-specific payload fields, flattened into `params`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventEnvelope {
    /// Build an unsequenced event. `ts` and `sequence` are stamped by the bus
    /// at publish time.
    pub fn new(method: impl Into<String>, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            method: method.into(),
            params: EventParams {
                run_id: run_id.clone(),
                agent_id: "orchestrator".to_string(),
                thread_id: run_id,
                turn_id: String::new(),
                item_id: String::new(),
                sequence: 0,
                ts: Utc::now(),
                schema_version: SCHEMA_VERSION.to_string(),
                extra: Map::new(),
            },
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.params.agent_id = agent_id.into();
        self
    }

    pub fn turn(mut self, turn_id: impl Into<String>) -> Self {
        self.params.turn_id = turn_id.into();
        self
    }

    pub fn item(mut self, item_id: impl Into<String>) -> Self {
        self.params.item_id = item_id.into();
        self
    }

    /// Merge kind-specific fields into `params`. Object payloads are
    /// flattened; anything else lands under a `data` key.
    pub fn payload(mut self, value: Value) -> Self {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    self.params.extra.insert(k, v);
                }
            }
            other => {
                self.params.extra.insert("data".to_string(), other);
            }
        }
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.extra.insert(key.into(), value);
        self
    }
}

/// Field names every event must carry to be applied by a consumer.
pub const REQUIRED_PARAM_FIELDS: [&str; 8] = [
    "runId",
    "agentId",
    "threadId",
    "turnId",
    "itemId",
    "sequence",
    "ts",
    "schemaVersion",
];

/// Check a raw JSON value for the envelope contract. Returns the missing
/// field names (empty = valid).
pub fn missing_required_fields(raw: &Value) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if raw.get("method").and_then(|m| m.as_str()).is_none() {
        missing.push("method");
    }
    let Some(params) = raw.get("params").and_then(|p| p.as_object()) else {
        missing.push("params");
        return missing;
    };
    for field in REQUIRED_PARAM_FIELDS {
        if !params.contains_key(field) {
            missing.push(field);
        }
    }
    missing
}
