// Evidence quality scoring.
//
// Pure: no I/O and no ambient clock. The caller injects `now`, so the same
// (evidence, links, now) always yields the same score.

use chrono::{DateTime, Duration, Utc};
use sentra_types::{Evidence, EvidenceRelationship, EvidenceScore, EvidenceType, RelationshipKind,
    ScoreBreakdown};

/// Weights over the six dimensions. Must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub source: f64,
    pub completeness: f64,
    pub freshness: f64,
    pub validation: f64,
    pub consistency: f64,
    pub relevance: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            source: 0.25,
            completeness: 0.20,
            freshness: 0.15,
            validation: 0.10,
            consistency: 0.15,
            relevance: 0.15,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.source
            + self.completeness
            + self.freshness
            + self.validation
            + self.consistency
            + self.relevance
    }
}

/// Static source reliability table. Unknown sources score 0.4.
pub fn source_reliability(source: &str) -> f64 {
    match source {
        "siem" => 0.9,
        "edr" => 0.85,
        "threat_intel" => 0.8,
        "firewall" => 0.75,
        "dns" => 0.7,
        "manual" => 0.6,
        _ => 0.4,
    }
}

/// Payload fields expected per evidence type, for the completeness dimension.
fn expected_fields(evidence_type: EvidenceType) -> &'static [&'static str] {
    match evidence_type {
        EvidenceType::Network => &["src_ip", "dst_ip", "protocol"],
        EvidenceType::Process => &["process", "hostname", "command_line"],
        EvidenceType::File => &["file_hash", "path", "hostname"],
        EvidenceType::Log => &["event_type", "timestamp"],
        EvidenceType::Alert => &["title", "severity"],
        EvidenceType::Enrichment => &["indicator", "reputation"],
        EvidenceType::Correlation => &["members", "kind"],
    }
}

fn field_present(payload: &serde_json::Value, field: &str) -> bool {
    fn walk(value: &serde_json::Value, field: &str) -> bool {
        match value {
            serde_json::Value::Object(obj) => {
                obj.contains_key(field) || obj.values().any(|v| walk(v, field))
            }
            serde_json::Value::Array(items) => items.iter().any(|i| walk(i, field)),
            _ => false,
        }
    }
    walk(payload, field)
}

const FRESHNESS_TAU_HOURS: f64 = 24.0;
const STALE_AFTER_DAYS: i64 = 30;
const STALE_CEILING: f64 = 0.3;

fn freshness(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age = now.signed_duration_since(timestamp);
    if age < Duration::zero() {
        // Future-dated evidence is not "fresh"; consistency flags it too.
        return 1.0;
    }
    let hours = age.num_milliseconds() as f64 / 3_600_000.0;
    let decayed = (-hours / FRESHNESS_TAU_HOURS).exp();
    if age > Duration::days(STALE_AFTER_DAYS) {
        decayed.min(STALE_CEILING)
    } else {
        decayed
    }
}

fn completeness(evidence: &Evidence) -> (f64, Vec<String>) {
    let mut factors = Vec::new();
    let expected = expected_fields(evidence.evidence_type);
    let present = expected
        .iter()
        .filter(|f| field_present(&evidence.payload, f))
        .count();
    let mut score = if expected.is_empty() {
        1.0
    } else {
        present as f64 / expected.len() as f64
    };
    if present < expected.len() {
        factors.push(format!(
            "{present}/{} expected fields present",
            expected.len()
        ));
    }
    if !evidence.entities.is_empty() {
        score += 0.1;
    } else {
        factors.push("no extracted entities".to_string());
    }
    if !evidence.tags.is_empty() {
        score += 0.05;
    }
    (score.min(1.0), factors)
}

fn consistency(evidence: &Evidence, now: DateTime<Utc>, completeness: f64) -> (f64, Vec<String>) {
    let mut passed = 0_u32;
    let mut factors = Vec::new();

    // (a) Entities mentioned in the payload appear in the entity map.
    let payload_entities = crate::extract::extract_entities(&evidence.payload);
    let mut covered = true;
    'outer: for (kind, values) in &payload_entities {
        for value in values {
            let present = evidence
                .entities
                .get(kind)
                .map(|set| set.contains(value))
                .unwrap_or(false);
            if !present {
                covered = false;
                factors.push(format!("payload entity {kind}:{value} missing from entities"));
                break 'outer;
            }
        }
    }
    if covered {
        passed += 1;
    }

    // (b) Timestamp not in the future by more than a minute.
    if evidence.timestamp <= now + Duration::minutes(1) {
        passed += 1;
    } else {
        factors.push("timestamp is in the future".to_string());
    }

    // (c) High confidence contradicted by poor completeness.
    if evidence.confidence > 0.8 && completeness < 0.3 {
        factors.push("high confidence on incomplete evidence".to_string());
    } else {
        passed += 1;
    }

    (f64::from(passed) / 3.0, factors)
}

fn validation(evidence: &Evidence) -> f64 {
    let structural = evidence.payload.is_object() || evidence.payload.is_array();
    let confidence_in_range = (0.0..=1.0).contains(&evidence.confidence);
    if structural && confidence_in_range {
        1.0
    } else {
        0.0
    }
}

fn relevance(evidence: &Evidence, links: &[EvidenceRelationship]) -> f64 {
    let weighted: f64 = links
        .iter()
        .filter(|l| {
            l.from_evidence_id == evidence.evidence_id || l.to_evidence_id == evidence.evidence_id
        })
        .map(|l| match l.kind {
            RelationshipKind::Causal => 1.0,
            RelationshipKind::Behavioral => 0.9,
            RelationshipKind::Entity => 0.8,
            RelationshipKind::Temporal => 0.6,
        })
        .sum();
    (weighted / 3.0).min(1.0)
}

/// Score one evidence row against its relationship context.
pub fn score_evidence(
    evidence: &Evidence,
    links: &[EvidenceRelationship],
    now: DateTime<Utc>,
) -> EvidenceScore {
    score_evidence_with(evidence, links, now, &ScoreWeights::default())
}

pub fn score_evidence_with(
    evidence: &Evidence,
    links: &[EvidenceRelationship],
    now: DateTime<Utc>,
    weights: &ScoreWeights,
) -> EvidenceScore {
    let mut factors = Vec::new();

    let source = source_reliability(&evidence.source);
    if source <= 0.4 {
        factors.push(format!("unrecognized source {}", evidence.source));
    }
    let (completeness, mut completeness_factors) = completeness(evidence);
    factors.append(&mut completeness_factors);
    let freshness = freshness(evidence.timestamp, now);
    let validation = validation(evidence);
    if validation == 0.0 {
        factors.push("structural validation failed".to_string());
    }
    let (consistency, mut consistency_factors) = consistency(evidence, now, completeness);
    factors.append(&mut consistency_factors);
    let relevance = relevance(evidence, links);

    let breakdown = ScoreBreakdown {
        source,
        completeness,
        freshness,
        validation,
        consistency,
        relevance,
    };
    let overall = weights.source * breakdown.source
        + weights.completeness * breakdown.completeness
        + weights.freshness * breakdown.freshness
        + weights.validation * breakdown.validation
        + weights.consistency * breakdown.consistency
        + weights.relevance * breakdown.relevance;

    EvidenceScore {
        overall: overall.clamp(0.0, 1.0),
        breakdown,
        factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_types::EntityMap;
    use serde_json::json;

    fn evidence(source: &str, age_hours: i64, now: DateTime<Utc>) -> Evidence {
        let mut entities = EntityMap::new();
        entities
            .entry("ip".to_string())
            .or_default()
            .insert("192.168.1.100".to_string());
        entities
            .entry("ip".to_string())
            .or_default()
            .insert("10.0.0.5".to_string());
        Evidence {
            evidence_id: "ev-1".to_string(),
            investigation_id: "inv-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            evidence_type: EvidenceType::Network,
            source: source.to_string(),
            timestamp: now - Duration::hours(age_hours),
            payload: json!({
                "src_ip": "192.168.1.100",
                "dst_ip": "10.0.0.5",
                "protocol": "tcp",
            }),
            entities,
            confidence: 0.8,
            quality_score: 0.0,
            tags: vec!["netflow".to_string()],
            mitre_techniques: vec![],
        }
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!((ScoreWeights::default().sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overall_equals_weighted_sum_of_breakdown() {
        let now = Utc::now();
        let score = score_evidence(&evidence("siem", 1, now), &[], now);
        let w = ScoreWeights::default();
        let expected = w.source * score.breakdown.source
            + w.completeness * score.breakdown.completeness
            + w.freshness * score.breakdown.freshness
            + w.validation * score.breakdown.validation
            + w.consistency * score.breakdown.consistency
            + w.relevance * score.breakdown.relevance;
        assert!((score.overall - expected).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&score.overall));
    }

    #[test]
    fn scoring_is_pure_given_now() {
        let now = Utc::now();
        let e = evidence("siem", 2, now);
        let a = score_evidence(&e, &[], now);
        let b = score_evidence(&e, &[], now);
        assert_eq!(a.overall, b.overall);
        assert_eq!(a.breakdown.freshness, b.breakdown.freshness);
    }

    #[test]
    fn unknown_source_scores_low() {
        let now = Utc::now();
        let score = score_evidence(&evidence("mystery-feed", 1, now), &[], now);
        assert!((score.breakdown.source - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn fresh_beats_stale() {
        let now = Utc::now();
        let fresh = score_evidence(&evidence("siem", 0, now), &[], now);
        let day_old = score_evidence(&evidence("siem", 24, now), &[], now);
        assert!(fresh.breakdown.freshness > day_old.breakdown.freshness);
    }

    #[test]
    fn month_old_evidence_capped_at_point_three() {
        let now = Utc::now();
        let stale = score_evidence(&evidence("siem", 31 * 24, now), &[], now);
        assert!(stale.breakdown.freshness <= 0.3);
    }

    #[test]
    fn future_timestamp_fails_consistency_check() {
        let now = Utc::now();
        let mut e = evidence("siem", 0, now);
        e.timestamp = now + Duration::minutes(5);
        let score = score_evidence(&e, &[], now);
        assert!(score.breakdown.consistency < 1.0);
        assert!(score
            .factors
            .iter()
            .any(|f| f.contains("future")));
    }

    #[test]
    fn missing_payload_entities_fail_consistency() {
        let now = Utc::now();
        let mut e = evidence("siem", 0, now);
        e.entities.clear();
        let score = score_evidence(&e, &[], now);
        assert!(score.breakdown.consistency < 1.0);
    }

    #[test]
    fn links_raise_relevance() {
        let now = Utc::now();
        let e = evidence("siem", 0, now);
        let links = vec![
            EvidenceRelationship {
                from_evidence_id: "ev-1".to_string(),
                to_evidence_id: "ev-2".to_string(),
                kind: RelationshipKind::Entity,
                strength: 0.9,
                rationale: "shared ip".to_string(),
            },
            EvidenceRelationship {
                from_evidence_id: "ev-3".to_string(),
                to_evidence_id: "ev-1".to_string(),
                kind: RelationshipKind::Temporal,
                strength: 0.7,
                rationale: "within window".to_string(),
            },
        ];
        let unlinked = score_evidence(&e, &[], now);
        let linked = score_evidence(&e, &links, now);
        assert!(linked.breakdown.relevance > unlinked.breakdown.relevance);
        assert!(linked.overall > unlinked.overall);
    }
}
