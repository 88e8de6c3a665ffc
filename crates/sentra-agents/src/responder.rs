//! Response agent: recommendations derived from the verdict.

use async_trait::async_trait;
use sentra_types::{
    Alert, Recommendation, RecommendationPriority, Severity, Verdict, VerdictClass,
};

use crate::{Agent, AgentContext, ValidationReport};

#[derive(Debug, Clone)]
pub struct ResponderInput {
    pub alert: Alert,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct ResponsePlan {
    pub recommendations: Vec<Recommendation>,
}

impl ResponsePlan {
    pub fn requires_approval(&self) -> bool {
        self.recommendations.iter().any(|r| r.requires_approval)
    }
}

pub struct ResponderAgent;

#[async_trait]
impl Agent for ResponderAgent {
    type Input = ResponderInput;
    type Output = ResponsePlan;

    fn name(&self) -> &'static str {
        "responder"
    }

    fn validate(&self, input: &ResponderInput) -> ValidationReport {
        if !(0.0..=1.0).contains(&input.verdict.confidence) {
            ValidationReport::invalid(vec!["verdict confidence out of range".to_string()])
        } else {
            ValidationReport::ok()
        }
    }

    async fn execute(
        &self,
        _context: &AgentContext,
        input: &ResponderInput,
    ) -> anyhow::Result<ResponsePlan> {
        let mut recommendations = Vec::new();
        let severe = matches!(input.alert.severity, Severity::Critical | Severity::High);

        match input.verdict.classification {
            VerdictClass::TruePositive => {
                recommendations.push(Recommendation {
                    title: "Isolate affected hosts".to_string(),
                    action: "isolate_host".to_string(),
                    priority: RecommendationPriority::High,
                    requires_approval: true,
                    rationale: "Confirmed malicious activity; containment limits spread."
                        .to_string(),
                });
                recommendations.push(Recommendation {
                    title: "Block malicious indicators".to_string(),
                    action: "block_indicators".to_string(),
                    priority: if severe {
                        RecommendationPriority::High
                    } else {
                        RecommendationPriority::Medium
                    },
                    requires_approval: severe,
                    rationale: "Deny further communication with known-bad infrastructure."
                        .to_string(),
                });
                recommendations.push(Recommendation {
                    title: "Reset credentials for involved accounts".to_string(),
                    action: "reset_credentials".to_string(),
                    priority: RecommendationPriority::Medium,
                    requires_approval: false,
                    rationale: "Credentials observed in the attack path may be compromised."
                        .to_string(),
                });
            }
            VerdictClass::FalsePositive => {
                recommendations.push(Recommendation {
                    title: "Close alert as false positive".to_string(),
                    action: "close_alert".to_string(),
                    priority: RecommendationPriority::Low,
                    requires_approval: false,
                    rationale: "Evidence does not support malicious activity.".to_string(),
                });
                recommendations.push(Recommendation {
                    title: "Tune the originating detection rule".to_string(),
                    action: "tune_detection".to_string(),
                    priority: RecommendationPriority::Low,
                    requires_approval: false,
                    rationale: "Reduce recurring noise from this detection.".to_string(),
                });
            }
            VerdictClass::RequiresReview => {
                recommendations.push(Recommendation {
                    title: "Escalate to senior analyst".to_string(),
                    action: "escalate".to_string(),
                    priority: RecommendationPriority::High,
                    requires_approval: false,
                    rationale: "Automated analysis could not reach a confident verdict."
                        .to_string(),
                });
            }
        }

        if !input.verdict.limitations.is_empty() {
            recommendations.push(Recommendation {
                title: "Restore unavailable data sources".to_string(),
                action: "escalate".to_string(),
                priority: RecommendationPriority::High,
                requires_approval: false,
                rationale: format!(
                    "Investigation ran with limited data sources: {}.",
                    input.verdict.limitations.join(", ")
                ),
            });
        }

        Ok(ResponsePlan { recommendations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentra_types::{EntityMap, TenantContext};

    fn responder_input(classification: VerdictClass, limitations: Vec<String>) -> ResponderInput {
        ResponderInput {
            alert: Alert {
                alert_id: "alert-1".to_string(),
                tenant_id: "tenant-a".to_string(),
                title: "Suspicious PowerShell".to_string(),
                severity: Severity::High,
                source: "edr".to_string(),
                timestamp: Utc::now(),
                raw_payload: serde_json::json!({}),
                entities: EntityMap::new(),
            },
            verdict: Verdict {
                classification,
                confidence: 0.7,
                reasoning: "test".to_string(),
                limitations,
            },
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            tenant: TenantContext::new("tenant-a", "user-1", "corr-1"),
            investigation_id: "inv-1".to_string(),
            run_id: "run-1".to_string(),
        }
    }

    #[tokio::test]
    async fn true_positive_containment_needs_approval() {
        let plan = ResponderAgent
            .execute(&context(), &responder_input(VerdictClass::TruePositive, vec![]))
            .await
            .unwrap();
        assert!(plan.requires_approval());
        assert!(plan
            .recommendations
            .iter()
            .any(|r| r.action == "isolate_host" && r.requires_approval));
    }

    #[tokio::test]
    async fn false_positive_closes_without_approval() {
        let plan = ResponderAgent
            .execute(
                &context(),
                &responder_input(VerdictClass::FalsePositive, vec![]),
            )
            .await
            .unwrap();
        assert!(!plan.requires_approval());
        assert!(plan.recommendations.iter().any(|r| r.action == "close_alert"));
    }

    #[tokio::test]
    async fn requires_review_escalates_high_priority() {
        let plan = ResponderAgent
            .execute(
                &context(),
                &responder_input(
                    VerdictClass::RequiresReview,
                    vec!["siem_unavailable".to_string()],
                ),
            )
            .await
            .unwrap();
        let escalations: Vec<_> = plan
            .recommendations
            .iter()
            .filter(|r| r.action == "escalate")
            .collect();
        assert!(!escalations.is_empty());
        assert!(escalations
            .iter()
            .all(|r| r.priority == RecommendationPriority::High));
    }
}
