// Deterministic entity extraction from step result payloads.

use std::sync::OnceLock;

use regex::Regex;
use sentra_types::EntityMap;
use serde_json::Value;

/// Explicit payload fields mapped to entity kinds.
const FIELD_KINDS: [(&str, &str); 8] = [
    ("src_ip", "ip"),
    ("dst_ip", "ip"),
    ("ip", "ip"),
    ("hostname", "host"),
    ("user", "user"),
    ("file_hash", "hash"),
    ("process", "process"),
    ("domain", "domain"),
];

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static regex"))
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[a-z0-9][a-z0-9-]{0,62}(?:\.[a-z0-9][a-z0-9-]{0,62})+\b")
            .expect("static regex")
    })
}

// Word boundaries keep a 32-hex from matching inside a longer hex run.
fn hex_re(len: usize) -> &'static Regex {
    static RE32: OnceLock<Regex> = OnceLock::new();
    static RE40: OnceLock<Regex> = OnceLock::new();
    static RE64: OnceLock<Regex> = OnceLock::new();
    let (cell, pattern) = match len {
        32 => (&RE32, r"\b[0-9a-fA-F]{32}\b"),
        40 => (&RE40, r"\b[0-9a-fA-F]{40}\b"),
        _ => (&RE64, r"\b[0-9a-fA-F]{64}\b"),
    };
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

fn technique_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bT\d{4}(?:\.\d{3})?\b").expect("static regex"))
}

fn valid_ipv4(candidate: &str) -> bool {
    candidate
        .split('.')
        .all(|octet| octet.parse::<u16>().map(|v| v <= 255).unwrap_or(false))
}

/// A plausible domain has an alphabetic top-level label, which also rejects
/// dotted quads already claimed by the IPv4 extractor.
fn valid_domain(candidate: &str) -> bool {
    candidate
        .rsplit('.')
        .next()
        .map(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or(false)
}

fn insert(map: &mut EntityMap, kind: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    map.entry(kind.to_string())
        .or_default()
        .insert(value.to_string());
}

fn scan_text(map: &mut EntityMap, text: &str) {
    for m in ipv4_re().find_iter(text) {
        if valid_ipv4(m.as_str()) {
            insert(map, "ip", m.as_str());
        }
    }
    for m in domain_re().find_iter(text) {
        if valid_domain(m.as_str()) {
            insert(map, "domain", &m.as_str().to_ascii_lowercase());
        }
    }
    for len in [32, 40, 64] {
        for m in hex_re(len).find_iter(text) {
            insert(map, "hash", &m.as_str().to_ascii_lowercase());
        }
    }
}

fn walk(map: &mut EntityMap, key: Option<&str>, value: &Value) {
    match value {
        Value::Object(obj) => {
            for (k, v) in obj {
                walk(map, Some(k.as_str()), v);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(map, key, item);
            }
        }
        Value::String(text) => {
            if let Some(key) = key {
                for (field, kind) in FIELD_KINDS {
                    if key == field {
                        insert(map, kind, text);
                    }
                }
            }
            scan_text(map, text);
        }
        _ => {}
    }
}

/// Extract entities from a payload: explicit well-known fields plus pattern
/// scans (IPv4, domains, 32/40/64-char hex digests) over every string value.
pub fn extract_entities(payload: &Value) -> EntityMap {
    let mut map = EntityMap::new();
    walk(&mut map, None, payload);
    map
}

/// Collect MITRE ATT&CK technique ids referenced anywhere in the payload.
pub fn extract_techniques(payload: &Value) -> Vec<String> {
    let mut out = std::collections::BTreeSet::new();
    collect_techniques(payload, &mut out);
    out.into_iter().collect()
}

fn collect_techniques(value: &Value, out: &mut std::collections::BTreeSet<String>) {
    match value {
        Value::Object(obj) => {
            for v in obj.values() {
                collect_techniques(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_techniques(item, out);
            }
        }
        Value::String(text) => {
            for m in technique_re().find_iter(text) {
                out.insert(m.as_str().to_string());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_explicit_fields() {
        let payload = json!({
            "src_ip": "192.168.1.100",
            "dst_ip": "10.0.0.5",
            "hostname": "ws-042",
            "user": "svc-admin",
            "file_hash": "abc123",
            "process": "powershell.exe",
        });
        let entities = extract_entities(&payload);
        assert!(entities["ip"].contains("192.168.1.100"));
        assert!(entities["ip"].contains("10.0.0.5"));
        assert!(entities["host"].contains("ws-042"));
        assert!(entities["user"].contains("svc-admin"));
        assert!(entities["hash"].contains("abc123"));
        assert!(entities["process"].contains("powershell.exe"));
    }

    #[test]
    fn scans_free_text_for_patterns() {
        let payload = json!({
            "message": "beacon to evil.example.com from 172.16.4.9, dropper \
                        d41d8cd98f00b204e9800998ecf8427e observed"
        });
        let entities = extract_entities(&payload);
        assert!(entities["domain"].contains("evil.example.com"));
        assert!(entities["ip"].contains("172.16.4.9"));
        assert!(entities["hash"].contains("d41d8cd98f00b204e9800998ecf8427e"));
    }

    #[test]
    fn rejects_invalid_ipv4_octets() {
        let payload = json!({"message": "version 999.999.999.999 installed"});
        let entities = extract_entities(&payload);
        assert!(!entities.contains_key("ip"));
    }

    #[test]
    fn dotted_quads_are_not_domains() {
        let payload = json!({"message": "connect 10.0.0.5 now"});
        let entities = extract_entities(&payload);
        assert!(!entities.contains_key("domain"));
        assert!(entities["ip"].contains("10.0.0.5"));
    }

    #[test]
    fn sha256_not_double_counted_as_md5() {
        let sha256 = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let payload = json!({ "file_hash": sha256 });
        let entities = extract_entities(&payload);
        assert_eq!(entities["hash"].len(), 1);
        assert!(entities["hash"].contains(sha256));
    }

    #[test]
    fn extraction_is_deterministic() {
        let payload = json!({"message": "10.1.1.1 and bad.example.org"});
        assert_eq!(extract_entities(&payload), extract_entities(&payload));
    }

    #[test]
    fn techniques_found_in_arrays_and_text() {
        let payload = json!({
            "mitre_techniques": ["T1059", "T1071"],
            "note": "matches T1566.001 phishing pattern",
        });
        let techniques = extract_techniques(&payload);
        assert_eq!(techniques, vec!["T1059", "T1071", "T1566.001"]);
    }
}
