//! Analyst agent: classifies the alert from accumulated evidence.

use async_trait::async_trait;
use sentra_types::{Alert, Correlation, Evidence, Verdict, VerdictClass};
use serde_json::Value;

use crate::{Agent, AgentContext, ValidationReport};

#[derive(Debug, Clone)]
pub struct AnalystInput {
    pub alert: Alert,
    pub evidence: Vec<Evidence>,
    pub correlations: Vec<Correlation>,
    /// Sources that were unavailable while gathering evidence, e.g.
    /// `siem_unavailable`.
    pub limitations: Vec<String>,
    /// Verdict corrections from human feedback, oldest first. The latest
    /// wins and the analyst re-runs with it appended to context.
    pub corrections: Vec<VerdictClass>,
}

pub struct AnalystAgent;

/// Confidence ceiling whenever any required source was missing.
const DEGRADED_CONFIDENCE_CAP: f64 = 0.79;

fn payload_flags_malicious(payload: &Value) -> bool {
    match payload {
        Value::Object(obj) => {
            if obj.get("malicious").and_then(|v| v.as_bool()) == Some(true) {
                return true;
            }
            if let Some(score) = obj.get("reputation").and_then(|v| v.as_f64()) {
                if score >= 0.8 {
                    return true;
                }
            }
            obj.values().any(payload_flags_malicious)
        }
        Value::Array(items) => items.iter().any(payload_flags_malicious),
        _ => false,
    }
}

#[async_trait]
impl Agent for AnalystAgent {
    type Input = AnalystInput;
    type Output = Verdict;

    fn name(&self) -> &'static str {
        "analyst"
    }

    fn validate(&self, input: &AnalystInput) -> ValidationReport {
        if input.alert.alert_id.is_empty() {
            ValidationReport::invalid(vec!["alert id is empty".to_string()])
        } else {
            ValidationReport::ok()
        }
    }

    async fn execute(
        &self,
        _context: &AgentContext,
        input: &AnalystInput,
    ) -> anyhow::Result<Verdict> {
        // A human correction overrides the heuristic outright.
        if let Some(corrected) = input.corrections.last() {
            return Ok(Verdict {
                classification: *corrected,
                confidence: 0.95_f64.min(if input.limitations.is_empty() {
                    0.95
                } else {
                    DEGRADED_CONFIDENCE_CAP
                }),
                reasoning: format!(
                    "Verdict set by analyst feedback correction; {} evidence items reviewed.",
                    input.evidence.len()
                ),
                limitations: input.limitations.clone(),
            });
        }

        let evidence_count = input.evidence.len();
        let indicator_count = input
            .evidence
            .iter()
            .filter(|e| payload_flags_malicious(&e.payload))
            .count();
        let max_correlation = input
            .correlations
            .iter()
            .map(|c| c.strength)
            .fold(0.0_f64, f64::max);

        let suspicion = 0.2 * (evidence_count as f64 / 5.0).min(1.0)
            + 0.5 * (indicator_count.min(3) as f64 / 3.0)
            + 0.3 * max_correlation;

        let (classification, mut confidence) = if evidence_count == 0 {
            (VerdictClass::RequiresReview, 0.3)
        } else if suspicion >= 0.55 {
            (VerdictClass::TruePositive, 0.55 + 0.45 * suspicion.min(1.0))
        } else if suspicion <= 0.2 {
            (VerdictClass::FalsePositive, 0.55 + 0.45 * (1.0 - suspicion))
        } else {
            (VerdictClass::RequiresReview, 0.4 + 0.2 * suspicion)
        };

        let mut reasoning = format!(
            "Reviewed {evidence_count} evidence items for alert '{}': \
             {indicator_count} carried malicious indicators; \
             strongest correlation {max_correlation:.2}.",
            input.alert.title
        );
        if !input.limitations.is_empty() {
            confidence = confidence.min(DEGRADED_CONFIDENCE_CAP);
            if evidence_count == 0 {
                confidence = confidence.min(0.45);
            }
            reasoning.push_str(&format!(
                " Assessment based on limited data sources ({}).",
                input.limitations.join(", ")
            ));
        }

        Ok(Verdict {
            classification,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning,
            limitations: input.limitations.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentra_types::{EntityMap, EvidenceType, RelationshipKind, Severity, TenantContext};
    use serde_json::json;

    fn alert() -> Alert {
        Alert {
            alert_id: "alert-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            title: "Suspicious PowerShell".to_string(),
            severity: Severity::High,
            source: "edr".to_string(),
            timestamp: Utc::now(),
            raw_payload: json!({}),
            entities: EntityMap::new(),
        }
    }

    fn evidence(id: &str, malicious: bool) -> Evidence {
        Evidence {
            evidence_id: id.to_string(),
            investigation_id: "inv-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            evidence_type: EvidenceType::Enrichment,
            source: "threat_intel".to_string(),
            timestamp: Utc::now(),
            payload: json!({"indicator": "x", "malicious": malicious, "reputation": if malicious { 0.92 } else { 0.1 }}),
            entities: EntityMap::new(),
            confidence: 0.8,
            quality_score: 0.7,
            tags: vec![],
            mitre_techniques: vec![],
        }
    }

    fn correlation(strength: f64) -> Correlation {
        Correlation {
            kind: RelationshipKind::Entity,
            members: vec!["a".to_string(), "b".to_string()],
            strength,
            window_ms: None,
            rationale: "shared entity".to_string(),
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            tenant: TenantContext::new("tenant-a", "user-1", "corr-1"),
            investigation_id: "inv-1".to_string(),
            run_id: "run-1".to_string(),
        }
    }

    fn input(evidence: Vec<Evidence>, correlations: Vec<Correlation>) -> AnalystInput {
        AnalystInput {
            alert: alert(),
            evidence,
            correlations,
            limitations: vec![],
            corrections: vec![],
        }
    }

    #[tokio::test]
    async fn malicious_indicators_yield_true_positive() {
        let verdict = AnalystAgent
            .execute(
                &context(),
                &input(
                    vec![
                        evidence("a", true),
                        evidence("b", true),
                        evidence("c", true),
                    ],
                    vec![correlation(0.9)],
                ),
            )
            .await
            .unwrap();
        assert_eq!(verdict.classification, VerdictClass::TruePositive);
        assert!(verdict.confidence > 0.8);
    }

    #[tokio::test]
    async fn clean_evidence_yields_false_positive() {
        let verdict = AnalystAgent
            .execute(&context(), &input(vec![evidence("a", false)], vec![]))
            .await
            .unwrap();
        assert_eq!(verdict.classification, VerdictClass::FalsePositive);
        assert!((0.0..=1.0).contains(&verdict.confidence));
    }

    #[tokio::test]
    async fn no_evidence_requires_review_with_low_confidence() {
        let mut analyst_input = input(vec![], vec![]);
        analyst_input.limitations = vec![
            "siem_unavailable".to_string(),
            "edr_unavailable".to_string(),
        ];
        let verdict = AnalystAgent
            .execute(&context(), &analyst_input)
            .await
            .unwrap();
        assert_eq!(verdict.classification, VerdictClass::RequiresReview);
        assert!(verdict.confidence < 0.5);
        assert!(verdict.reasoning.contains("limited data sources"));
        assert_eq!(verdict.limitations.len(), 2);
    }

    #[tokio::test]
    async fn limitations_cap_confidence_below_degraded_ceiling() {
        let mut analyst_input = input(
            vec![
                evidence("a", true),
                evidence("b", true),
                evidence("c", true),
            ],
            vec![correlation(0.95)],
        );
        analyst_input.limitations = vec!["siem_unavailable".to_string()];
        let verdict = AnalystAgent
            .execute(&context(), &analyst_input)
            .await
            .unwrap();
        assert!(verdict.confidence < 0.8);
    }

    #[tokio::test]
    async fn correction_overrides_heuristic() {
        let mut analyst_input = input(vec![evidence("a", true)], vec![correlation(0.9)]);
        analyst_input.corrections = vec![VerdictClass::FalsePositive];
        let verdict = AnalystAgent
            .execute(&context(), &analyst_input)
            .await
            .unwrap();
        assert_eq!(verdict.classification, VerdictClass::FalsePositive);
        assert!(verdict.reasoning.contains("feedback correction"));
    }

    #[tokio::test]
    async fn verdict_is_deterministic() {
        let analyst_input = input(vec![evidence("a", true)], vec![correlation(0.5)]);
        let first = AnalystAgent
            .execute(&context(), &analyst_input)
            .await
            .unwrap();
        let second = AnalystAgent
            .execute(&context(), &analyst_input)
            .await
            .unwrap();
        assert_eq!(first.classification, second.classification);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.reasoning, second.reasoning);
    }
}
