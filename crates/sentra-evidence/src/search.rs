// Evidence search: field-qualified query grammar with pagination and facets.
//
// Grammar tokens: `type:T`, `source:S`, `confidence:>0.8`, `entity:kind:value`,
// anything else is matched as free text against payload and tags.

use chrono::{DateTime, Duration, Utc};
use sentra_types::{Evidence, EvidenceType};
use serde::{Deserialize, Serialize};

use crate::db::SqliteStore;
use crate::types::StoreResult;

/// Internal scan bound: facets are computed over at most this many rows.
const SEARCH_SCAN_CAP: usize = 5_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub evidence_type: Option<EvidenceType>,
    pub source: Option<String>,
    pub confidence_min: Option<f64>,
    pub entity: Option<(String, String)>,
    pub free_text: Vec<String>,
}

/// Parse the search grammar. Unknown qualifiers fall back to free text.
pub fn parse_query(input: &str) -> SearchQuery {
    let mut query = SearchQuery::default();
    for token in input.split_whitespace() {
        if let Some(rest) = token.strip_prefix("type:") {
            if let Ok(t) = rest.parse::<EvidenceType>() {
                query.evidence_type = Some(t);
                continue;
            }
        }
        if let Some(rest) = token.strip_prefix("source:") {
            if !rest.is_empty() {
                query.source = Some(rest.to_string());
                continue;
            }
        }
        if let Some(rest) = token.strip_prefix("confidence:>") {
            if let Ok(threshold) = rest.parse::<f64>() {
                query.confidence_min = Some(threshold);
                continue;
            }
        }
        if let Some(rest) = token.strip_prefix("entity:") {
            if let Some((kind, value)) = rest.split_once(':') {
                if !kind.is_empty() && !value.is_empty() {
                    query.entity = Some((kind.to_string(), value.to_string()));
                    continue;
                }
            }
        }
        query.free_text.push(token.to_ascii_lowercase());
    }
    query
}

fn matches(evidence: &Evidence, query: &SearchQuery) -> bool {
    if let Some(t) = query.evidence_type {
        if evidence.evidence_type != t {
            return false;
        }
    }
    if let Some(source) = &query.source {
        if &evidence.source != source {
            return false;
        }
    }
    if let Some(min) = query.confidence_min {
        if evidence.confidence <= min {
            return false;
        }
    }
    if let Some((kind, value)) = &query.entity {
        let present = evidence
            .entities
            .get(kind)
            .map(|set| set.contains(value))
            .unwrap_or(false);
        if !present {
            return false;
        }
    }
    if !query.free_text.is_empty() {
        let haystack = format!(
            "{} {}",
            evidence.payload.to_string().to_ascii_lowercase(),
            evidence.tags.join(" ").to_ascii_lowercase()
        );
        if !query.free_text.iter().all(|t| haystack.contains(t)) {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFacets {
    #[serde(rename = "byType")]
    pub by_type: Vec<(String, u64)>,
    #[serde(rename = "bySource")]
    pub by_source: Vec<(String, u64)>,
    /// Buckets: `[0,0.5)`, `[0.5,0.8)`, `[0.8,1]`.
    #[serde(rename = "byConfidence")]
    pub by_confidence: Vec<(String, u64)>,
    /// Buckets: last 24h, last 7d, last 30d, older.
    #[serde(rename = "byAge")]
    pub by_age: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<Evidence>,
    pub total: u64,
    pub facets: SearchFacets,
    pub limit: usize,
    pub offset: usize,
}

/// Run a parsed query for a tenant. Facets cover the full match set (up to
/// the scan cap); `hits` is the requested page.
pub async fn search_evidence(
    store: &SqliteStore,
    tenant_id: &str,
    query: &SearchQuery,
    limit: usize,
    offset: usize,
    now: DateTime<Utc>,
) -> StoreResult<SearchResults> {
    let all = store.evidence_for_tenant(tenant_id, SEARCH_SCAN_CAP).await?;
    let matching: Vec<Evidence> = all.into_iter().filter(|e| matches(e, query)).collect();

    let facets = build_facets(&matching, now);
    let total = matching.len() as u64;
    let hits = matching
        .into_iter()
        .skip(offset)
        .take(limit.clamp(1, 200))
        .collect();

    Ok(SearchResults {
        hits,
        total,
        facets,
        limit: limit.clamp(1, 200),
        offset,
    })
}

fn build_facets(matching: &[Evidence], now: DateTime<Utc>) -> SearchFacets {
    use std::collections::BTreeMap;

    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_confidence: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut by_age: BTreeMap<&'static str, u64> = BTreeMap::new();

    for evidence in matching {
        *by_type
            .entry(evidence.evidence_type.as_str().to_string())
            .or_insert(0) += 1;
        *by_source.entry(evidence.source.clone()).or_insert(0) += 1;

        let confidence_bucket = if evidence.confidence < 0.5 {
            "low"
        } else if evidence.confidence < 0.8 {
            "medium"
        } else {
            "high"
        };
        *by_confidence.entry(confidence_bucket).or_insert(0) += 1;

        let age = now.signed_duration_since(evidence.timestamp);
        let age_bucket = if age <= Duration::hours(24) {
            "24h"
        } else if age <= Duration::days(7) {
            "7d"
        } else if age <= Duration::days(30) {
            "30d"
        } else {
            "older"
        };
        *by_age.entry(age_bucket).or_insert(0) += 1;
    }

    SearchFacets {
        by_type: by_type.into_iter().collect(),
        by_source: by_source.into_iter().collect(),
        by_confidence: by_confidence
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        by_age: by_age.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_types::EntityMap;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn parses_field_qualifiers() {
        let query = parse_query("type:network source:siem confidence:>0.8 entity:ip:10.0.0.5 beacon");
        assert_eq!(query.evidence_type, Some(EvidenceType::Network));
        assert_eq!(query.source.as_deref(), Some("siem"));
        assert_eq!(query.confidence_min, Some(0.8));
        assert_eq!(
            query.entity,
            Some(("ip".to_string(), "10.0.0.5".to_string()))
        );
        assert_eq!(query.free_text, vec!["beacon"]);
    }

    #[test]
    fn malformed_qualifiers_become_free_text() {
        let query = parse_query("type:warpcore entity:broken");
        assert!(query.evidence_type.is_none());
        assert!(query.entity.is_none());
        assert_eq!(query.free_text.len(), 2);
    }

    async fn seeded_store() -> (SqliteStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(&temp.path().join("sentra.db"))
            .await
            .unwrap();
        for (i, (source, evidence_type, confidence)) in [
            ("siem", EvidenceType::Network, 0.9),
            ("siem", EvidenceType::Log, 0.6),
            ("edr", EvidenceType::Process, 0.85),
        ]
        .iter()
        .enumerate()
        {
            let mut entities = EntityMap::new();
            entities
                .entry("ip".to_string())
                .or_default()
                .insert("192.168.1.100".to_string());
            store
                .insert_evidence(&Evidence {
                    evidence_id: format!("ev-{i}"),
                    investigation_id: "inv-1".to_string(),
                    tenant_id: "tenant-a".to_string(),
                    evidence_type: *evidence_type,
                    source: source.to_string(),
                    timestamp: Utc::now(),
                    payload: json!({"note": "suspicious beacon traffic"}),
                    entities,
                    confidence: *confidence,
                    quality_score: 0.5,
                    tags: vec!["beacon".to_string()],
                    mitre_techniques: vec![],
                })
                .await
                .unwrap();
        }
        (store, temp)
    }

    #[tokio::test]
    async fn search_filters_and_facets() {
        let (store, _tmp) = seeded_store().await;
        let query = parse_query("source:siem");
        let results = search_evidence(&store, "tenant-a", &query, 50, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(results.total, 2);
        assert!(results
            .facets
            .by_type
            .iter()
            .any(|(t, c)| t == "network" && *c == 1));
        assert!(results
            .facets
            .by_confidence
            .iter()
            .any(|(b, c)| b == "medium" && *c == 1));
    }

    #[tokio::test]
    async fn confidence_threshold_is_strict() {
        let (store, _tmp) = seeded_store().await;
        let query = parse_query("confidence:>0.85");
        let results = search_evidence(&store, "tenant-a", &query, 50, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.hits[0].source, "siem");
    }

    #[tokio::test]
    async fn entity_qualifier_matches_exact_value() {
        let (store, _tmp) = seeded_store().await;
        let query = parse_query("entity:ip:192.168.1.100");
        let results = search_evidence(&store, "tenant-a", &query, 50, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(results.total, 3);

        let query = parse_query("entity:ip:1.2.3.4");
        let results = search_evidence(&store, "tenant-a", &query, 50, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(results.total, 0);
    }

    #[tokio::test]
    async fn pagination_slices_hits_but_not_total() {
        let (store, _tmp) = seeded_store().await;
        let query = SearchQuery::default();
        let page = search_evidence(&store, "tenant-a", &query, 2, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 2);
        let rest = search_evidence(&store, "tenant-a", &query, 2, 2, Utc::now())
            .await
            .unwrap();
        assert_eq!(rest.hits.len(), 1);
    }

    #[tokio::test]
    async fn tenant_isolation_in_search() {
        let (store, _tmp) = seeded_store().await;
        let results = search_evidence(&store, "tenant-b", &SearchQuery::default(), 50, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(results.total, 0);
    }
}
