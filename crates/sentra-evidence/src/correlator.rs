// Deterministic correlation analysis over an investigation's evidence.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sentra_types::{
    Correlation, CorrelationNetwork, Evidence, EvidenceRelationship, NetworkEdge, NetworkNode,
    RelationshipKind,
};

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Window for temporal links.
    pub time_window_ms: u64,
    /// Entity-overlap count that saturates link strength.
    pub max_overlap: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            time_window_ms: 300_000,
            max_overlap: 3,
        }
    }
}

/// Derive temporal, entity, and behavioral links between evidence rows.
///
/// Links are directed from the earlier row to the later one (ties broken by
/// evidence id) so repeated runs produce identical rows.
pub fn derive_relationships(
    evidence: &[Evidence],
    config: &CorrelatorConfig,
) -> Vec<EvidenceRelationship> {
    let mut out = Vec::new();
    let window_ms = config.time_window_ms as i64;

    for (i, a) in evidence.iter().enumerate() {
        for b in evidence.iter().skip(i + 1) {
            let (from, to) = orient(a, b);

            // Temporal proximity.
            let dt_ms = (to.timestamp - from.timestamp).num_milliseconds().abs();
            if dt_ms <= window_ms {
                let strength = 1.0 - dt_ms as f64 / window_ms as f64;
                out.push(EvidenceRelationship {
                    from_evidence_id: from.evidence_id.clone(),
                    to_evidence_id: to.evidence_id.clone(),
                    kind: RelationshipKind::Temporal,
                    strength,
                    rationale: format!("observed {}ms apart", dt_ms),
                });
            }

            // Shared entities.
            let shared = shared_entities(from, to);
            if !shared.is_empty() {
                let strength = (shared.len() as f64 / config.max_overlap as f64).min(1.0);
                let sample = shared
                    .iter()
                    .take(3)
                    .map(|(kind, value)| format!("{kind}:{value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push(EvidenceRelationship {
                    from_evidence_id: from.evidence_id.clone(),
                    to_evidence_id: to.evidence_id.clone(),
                    kind: RelationshipKind::Entity,
                    strength,
                    rationale: format!("shared entities: {sample}"),
                });
            }

            // Overlapping MITRE techniques.
            let jaccard = technique_jaccard(from, to);
            if jaccard > 0.0 {
                out.push(EvidenceRelationship {
                    from_evidence_id: from.evidence_id.clone(),
                    to_evidence_id: to.evidence_id.clone(),
                    kind: RelationshipKind::Behavioral,
                    strength: jaccard,
                    rationale: "overlapping attack techniques".to_string(),
                });
            }
        }
    }

    out
}

fn orient<'a>(a: &'a Evidence, b: &'a Evidence) -> (&'a Evidence, &'a Evidence) {
    if (a.timestamp, &a.evidence_id) <= (b.timestamp, &b.evidence_id) {
        (a, b)
    } else {
        (b, a)
    }
}

fn shared_entities(a: &Evidence, b: &Evidence) -> Vec<(String, String)> {
    let mut shared = Vec::new();
    for (kind, values) in &a.entities {
        if let Some(other) = b.entities.get(kind) {
            for value in values.intersection(other) {
                shared.push((kind.clone(), value.clone()));
            }
        }
    }
    shared
}

fn technique_jaccard(a: &Evidence, b: &Evidence) -> f64 {
    let left: BTreeSet<&String> = a.mitre_techniques.iter().collect();
    let right: BTreeSet<&String> = b.mitre_techniques.iter().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    if intersection == 0 {
        return 0.0;
    }
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

/// Fold pairwise links into aggregate correlations: connected components per
/// relationship kind, strength = mean edge strength.
pub fn build_correlations(
    relationships: &[EvidenceRelationship],
    config: &CorrelatorConfig,
) -> Vec<Correlation> {
    let mut out = Vec::new();
    for kind in [
        RelationshipKind::Temporal,
        RelationshipKind::Entity,
        RelationshipKind::Behavioral,
        RelationshipKind::Causal,
    ] {
        let edges: Vec<&EvidenceRelationship> =
            relationships.iter().filter(|r| r.kind == kind).collect();
        if edges.is_empty() {
            continue;
        }

        // Union-find over evidence ids.
        let mut parent: HashMap<&str, &str> = HashMap::new();
        fn find<'a>(parent: &HashMap<&'a str, &'a str>, mut id: &'a str) -> &'a str {
            while let Some(next) = parent.get(id) {
                if *next == id {
                    break;
                }
                id = next;
            }
            id
        }
        for edge in &edges {
            let from = edge.from_evidence_id.as_str();
            let to = edge.to_evidence_id.as_str();
            parent.entry(from).or_insert(from);
            parent.entry(to).or_insert(to);
            let root_from = find(&parent, from);
            let root_to = find(&parent, to);
            if root_from != root_to {
                parent.insert(root_to, root_from);
            }
        }

        let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut strengths: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for edge in &edges {
            let root = find(&parent, edge.from_evidence_id.as_str()).to_string();
            let entry = members.entry(root.clone()).or_default();
            entry.insert(edge.from_evidence_id.clone());
            entry.insert(edge.to_evidence_id.clone());
            strengths.entry(root).or_default().push(edge.strength);
        }

        for (root, group) in members {
            let edge_strengths = &strengths[&root];
            let mean = edge_strengths.iter().sum::<f64>() / edge_strengths.len() as f64;
            out.push(Correlation {
                kind,
                members: group.into_iter().collect(),
                strength: mean,
                window_ms: matches!(kind, RelationshipKind::Temporal)
                    .then_some(config.time_window_ms),
                rationale: match kind {
                    RelationshipKind::Temporal => "evidence cluster within time window".to_string(),
                    RelationshipKind::Entity => "evidence sharing entities".to_string(),
                    RelationshipKind::Behavioral => {
                        "evidence with overlapping techniques".to_string()
                    }
                    RelationshipKind::Causal => "causally chained evidence".to_string(),
                },
            });
        }
    }
    out
}

/// Entity-centric graph view. Nodes are entities sized by how many evidence
/// rows involve them; each relationship contributes an edge between the
/// first entity of each endpoint, width = link strength.
pub fn correlation_network(
    evidence: &[Evidence],
    relationships: &[EvidenceRelationship],
) -> CorrelationNetwork {
    let mut involvement: BTreeMap<String, usize> = BTreeMap::new();
    let mut primary: HashMap<&str, String> = HashMap::new();

    for row in evidence {
        for (kind, values) in &row.entities {
            for value in values {
                *involvement.entry(format!("{kind}:{value}")).or_insert(0) += 1;
            }
        }
        if let Some((kind, values)) = row.entities.iter().next() {
            if let Some(value) = values.iter().next() {
                primary.insert(row.evidence_id.as_str(), format!("{kind}:{value}"));
            }
        }
    }

    let nodes = involvement
        .iter()
        .map(|(id, count)| NetworkNode {
            id: id.clone(),
            label: id.split_once(':').map(|(_, v)| v.to_string()).unwrap_or_else(|| id.clone()),
            size: *count,
        })
        .collect();

    let mut edges: Vec<NetworkEdge> = Vec::new();
    let mut seen: BTreeSet<(String, String, &'static str)> = BTreeSet::new();
    for rel in relationships {
        let (Some(from), Some(to)) = (
            primary.get(rel.from_evidence_id.as_str()),
            primary.get(rel.to_evidence_id.as_str()),
        ) else {
            continue;
        };
        if from == to {
            continue;
        }
        if seen.insert((from.clone(), to.clone(), rel.kind.as_str())) {
            edges.push(NetworkEdge {
                from: from.clone(),
                to: to.clone(),
                kind: rel.kind,
                strength: rel.strength,
            });
        }
    }

    CorrelationNetwork { nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use sentra_types::{EntityMap, EvidenceType};
    use serde_json::json;

    fn evidence(id: &str, offset_secs: i64, entities: &[(&str, &str)], techniques: &[&str]) -> Evidence {
        let mut map = EntityMap::new();
        for (kind, value) in entities {
            map.entry(kind.to_string())
                .or_default()
                .insert(value.to_string());
        }
        Evidence {
            evidence_id: id.to_string(),
            investigation_id: "inv-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            evidence_type: EvidenceType::Network,
            source: "siem".to_string(),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            payload: json!({}),
            entities: map,
            confidence: 0.8,
            quality_score: 0.5,
            tags: vec![],
            mitre_techniques: techniques.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn temporal_strength_decays_with_distance() {
        let config = CorrelatorConfig::default();
        let rows = vec![
            evidence("a", 0, &[], &[]),
            evidence("b", 30, &[], &[]),
            evidence("c", 290, &[], &[]),
        ];
        let links = derive_relationships(&rows, &config);
        let ab = links
            .iter()
            .find(|l| {
                l.kind == RelationshipKind::Temporal
                    && l.from_evidence_id == "a"
                    && l.to_evidence_id == "b"
            })
            .unwrap();
        let ac = links
            .iter()
            .find(|l| {
                l.kind == RelationshipKind::Temporal
                    && l.from_evidence_id == "a"
                    && l.to_evidence_id == "c"
            })
            .unwrap();
        assert!(ab.strength > ac.strength);
        assert!(ab.strength > 0.85);
    }

    #[test]
    fn far_apart_rows_have_no_temporal_link() {
        let config = CorrelatorConfig::default();
        let rows = vec![evidence("a", 0, &[], &[]), evidence("b", 400, &[], &[])];
        let links = derive_relationships(&rows, &config);
        assert!(!links.iter().any(|l| l.kind == RelationshipKind::Temporal));
    }

    #[test]
    fn shared_entity_produces_entity_link() {
        let config = CorrelatorConfig::default();
        let rows = vec![
            evidence("a", 0, &[("ip", "192.168.1.100")], &[]),
            evidence("b", 1_000, &[("ip", "192.168.1.100"), ("host", "ws-1")], &[]),
        ];
        let links = derive_relationships(&rows, &config);
        let entity = links
            .iter()
            .find(|l| l.kind == RelationshipKind::Entity)
            .unwrap();
        assert!(entity.rationale.contains("ip:192.168.1.100"));
        assert!((entity.strength - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn behavioral_link_uses_jaccard() {
        let config = CorrelatorConfig::default();
        let rows = vec![
            evidence("a", 0, &[], &["T1059", "T1071"]),
            evidence("b", 1_000, &[], &["T1071", "T1566"]),
        ];
        let links = derive_relationships(&rows, &config);
        let behavioral = links
            .iter()
            .find(|l| l.kind == RelationshipKind::Behavioral)
            .unwrap();
        // |{T1071}| / |{T1059,T1071,T1566}|
        assert!((behavioral.strength - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn derivation_is_deterministic() {
        let config = CorrelatorConfig::default();
        let rows = vec![
            evidence("a", 0, &[("ip", "10.0.0.5")], &["T1059"]),
            evidence("b", 10, &[("ip", "10.0.0.5")], &["T1059"]),
        ];
        let first = derive_relationships(&rows, &config);
        let second = derive_relationships(&rows, &config);
        assert_eq!(first.len(), second.len());
        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.from_evidence_id, y.from_evidence_id);
            assert_eq!(x.strength, y.strength);
        }
    }

    #[test]
    fn correlations_group_connected_members() {
        let config = CorrelatorConfig::default();
        let rows = vec![
            evidence("a", 0, &[("ip", "10.0.0.5")], &[]),
            evidence("b", 10, &[("ip", "10.0.0.5")], &[]),
            evidence("c", 20, &[("ip", "10.0.0.5")], &[]),
        ];
        let links = derive_relationships(&rows, &config);
        let correlations = build_correlations(&links, &config);
        let entity_corr = correlations
            .iter()
            .find(|c| c.kind == RelationshipKind::Entity)
            .unwrap();
        assert_eq!(entity_corr.members.len(), 3);
        assert!(entity_corr.strength > 0.0);
    }

    #[test]
    fn network_sizes_nodes_by_involvement() {
        let config = CorrelatorConfig::default();
        let rows = vec![
            evidence("a", 0, &[("ip", "10.0.0.5")], &[]),
            evidence("b", 10, &[("ip", "10.0.0.5"), ("host", "ws-1")], &[]),
        ];
        let links = derive_relationships(&rows, &config);
        let network = correlation_network(&rows, &links);
        let ip_node = network.nodes.iter().find(|n| n.id == "ip:10.0.0.5").unwrap();
        assert_eq!(ip_node.size, 2);
        let host_node = network.nodes.iter().find(|n| n.id == "host:ws-1").unwrap();
        assert_eq!(host_node.size, 1);
    }
}
