use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EntityMap;

/// Kind of observation captured by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Network,
    Process,
    File,
    Log,
    Alert,
    Enrichment,
    Correlation,
}

impl EvidenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceType::Network => "network",
            EvidenceType::Process => "process",
            EvidenceType::File => "file",
            EvidenceType::Log => "log",
            EvidenceType::Alert => "alert",
            EvidenceType::Enrichment => "enrichment",
            EvidenceType::Correlation => "correlation",
        }
    }
}

impl std::str::FromStr for EvidenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(EvidenceType::Network),
            "process" => Ok(EvidenceType::Process),
            "file" => Ok(EvidenceType::File),
            "log" => Ok(EvidenceType::Log),
            "alert" => Ok(EvidenceType::Alert),
            "enrichment" => Ok(EvidenceType::Enrichment),
            "correlation" => Ok(EvidenceType::Correlation),
            other => Err(format!("unknown evidence type: {other}")),
        }
    }
}

/// A persisted observation extracted from a step's result.
///
/// Append-only after write; quality/confidence corrections produce a new row
/// and retain the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "evidenceId")]
    pub evidence_id: String,
    #[serde(rename = "investigationId")]
    pub investigation_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub entities: EntityMap,
    /// Producer-asserted confidence in [0,1].
    pub confidence: f64,
    /// Scorer-derived quality in [0,1].
    #[serde(rename = "qualityScore")]
    pub quality_score: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// MITRE ATT&CK technique ids attached by enrichment, e.g. `T1059`.
    #[serde(rename = "mitreTechniques", default)]
    pub mitre_techniques: Vec<String>,
}

/// Relationship classes the correlator derives between evidence rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Temporal,
    Entity,
    Behavioral,
    Causal,
}

impl RelationshipKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipKind::Temporal => "temporal",
            RelationshipKind::Entity => "entity",
            RelationshipKind::Behavioral => "behavioral",
            RelationshipKind::Causal => "causal",
        }
    }
}

impl std::str::FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(RelationshipKind::Temporal),
            "entity" => Ok(RelationshipKind::Entity),
            "behavioral" => Ok(RelationshipKind::Behavioral),
            "causal" => Ok(RelationshipKind::Causal),
            other => Err(format!("unknown relationship kind: {other}")),
        }
    }
}

/// A directed link between two evidence rows. Stored as its own row so the
/// evidence graph is walked by index lookup, never by embedded objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRelationship {
    #[serde(rename = "fromEvidenceId")]
    pub from_evidence_id: String,
    #[serde(rename = "toEvidenceId")]
    pub to_evidence_id: String,
    pub kind: RelationshipKind,
    /// [0,1].
    pub strength: f64,
    pub rationale: String,
}

/// Derived aggregate over evidence sharing a window, an entity, or a
/// technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub kind: RelationshipKind,
    pub members: Vec<String>,
    pub strength: f64,
    #[serde(rename = "windowMs", skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    pub rationale: String,
}

/// Quality-score breakdown across the six weighted dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub source: f64,
    pub completeness: f64,
    pub freshness: f64,
    pub validation: f64,
    pub consistency: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceScore {
    pub overall: f64,
    pub breakdown: ScoreBreakdown,
    /// Human-readable notes on what moved the score.
    #[serde(default)]
    pub factors: Vec<String>,
}

/// Node/edge view of the correlation graph for force-directed rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationNetwork {
    pub nodes: Vec<NetworkNode>,
    pub edges: Vec<NetworkEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: String,
    pub label: String,
    /// Proportional to the number of evidence rows involving this entity.
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEdge {
    pub from: String,
    pub to: String,
    pub kind: RelationshipKind,
    /// Edge width is proportional to link strength.
    pub strength: f64,
}
