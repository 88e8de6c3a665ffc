use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A human approval gate raised by the response agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub risk: String,
    pub status: ApprovalStatus,
    #[serde(rename = "requestedAt")]
    pub requested_at: DateTime<Utc>,
    #[serde(rename = "respondedAt")]
    pub responded_at: Option<DateTime<Utc>>,
    /// False when the id was synthesized by the bus rather than supplied by
    /// the producer.
    #[serde(default = "default_verified")]
    pub verified: bool,
}

fn default_verified() -> bool {
    true
}

/// Seed material for deterministic approval-id synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalSeed<'a> {
    #[serde(rename = "runId")]
    pub run_id: &'a str,
    #[serde(rename = "agentId")]
    pub agent_id: &'a str,
    pub ts: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub payload: &'a Value,
}

/// Synthesize the approval id the bus assigns when the producer omitted one:
/// `req_` + 32-bit FNV-1a over the stable stringification of the seed.
pub fn synthesize_request_id(seed: &ApprovalSeed<'_>) -> String {
    let value = serde_json::to_value(seed).unwrap_or(Value::Null);
    let canonical = stable_stringify(&value);
    format!("req_{:08x}", fnv1a_32(canonical.as_bytes()))
}

/// Deterministic JSON stringification: object keys sorted, no whitespace.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_stable(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fnv1a_matches_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn stable_stringify_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(stable_stringify(&value), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn synthesized_id_is_deterministic() {
        let payload = json!({"action": "isolate_host"});
        let seed = ApprovalSeed {
            run_id: "run-1",
            agent_id: "responder",
            ts: "2026-08-01T00:00:00Z",
            title: "Isolate host",
            description: "Quarantine the workstation",
            payload: &payload,
        };
        let a = synthesize_request_id(&seed);
        let b = synthesize_request_id(&seed);
        assert_eq!(a, b);
        assert!(a.starts_with("req_"));
        assert_eq!(a.len(), 4 + 8);
    }

    #[test]
    fn synthesized_id_varies_with_seed() {
        let payload = json!({});
        let seed_a = ApprovalSeed {
            run_id: "run-1",
            agent_id: "responder",
            ts: "2026-08-01T00:00:00Z",
            title: "A",
            description: "",
            payload: &payload,
        };
        let seed_b = ApprovalSeed { title: "B", ..seed_a.clone() };
        assert_ne!(synthesize_request_id(&seed_a), synthesize_request_id(&seed_b));
    }
}
