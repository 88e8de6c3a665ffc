//! Planner agent: turns an alert into a step DAG.

use async_trait::async_trait;
use sentra_evidence::extract_entities;
use sentra_types::{Alert, EntityMap, Plan, Step, StepStatus, StepType};
use serde_json::json;

use crate::{Agent, AgentContext, ValidationReport};

#[derive(Debug, Clone)]
pub struct PlannerInput {
    pub alert: Alert,
    /// Connector types currently available for this tenant, primary first.
    pub available_sources: Vec<String>,
    pub step_timeout_ms: u64,
    pub max_retries: u32,
}

pub struct PlannerAgent;

impl PlannerAgent {
    fn entities_payload(entities: &EntityMap) -> serde_json::Value {
        json!({
            "ip": entities.get("ip").map(|s| s.iter().collect::<Vec<_>>()).unwrap_or_default(),
            "domain": entities.get("domain").map(|s| s.iter().collect::<Vec<_>>()).unwrap_or_default(),
            "hash": entities.get("hash").map(|s| s.iter().collect::<Vec<_>>()).unwrap_or_default(),
            "host": entities.get("host").map(|s| s.iter().collect::<Vec<_>>()).unwrap_or_default(),
            "user": entities.get("user").map(|s| s.iter().collect::<Vec<_>>()).unwrap_or_default(),
            "process": entities.get("process").map(|s| s.iter().collect::<Vec<_>>()).unwrap_or_default(),
        })
    }

    fn step(
        id: &str,
        name: &str,
        step_type: StepType,
        dependencies: Vec<String>,
        payload: serde_json::Value,
        data_sources: Vec<String>,
        input: &PlannerInput,
    ) -> Step {
        Step {
            step_id: id.to_string(),
            name: name.to_string(),
            step_type,
            dependencies,
            payload,
            data_sources,
            timeout_ms: input.step_timeout_ms,
            max_retries: input.max_retries,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            non_critical: false,
        }
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    type Input = PlannerInput;
    type Output = Plan;

    fn name(&self) -> &'static str {
        "planner"
    }

    fn validate(&self, input: &PlannerInput) -> ValidationReport {
        let mut errors = Vec::new();
        if input.alert.alert_id.is_empty() {
            errors.push("alert id is empty".to_string());
        }
        if input.alert.tenant_id.is_empty() {
            errors.push("tenant id is empty".to_string());
        }
        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::invalid(errors)
        }
    }

    async fn execute(&self, context: &AgentContext, input: &PlannerInput) -> anyhow::Result<Plan> {
        // Alert-declared entities, supplemented by extraction from the raw
        // payload.
        let mut entities = input.alert.entities.clone();
        for (kind, values) in extract_entities(&input.alert.raw_payload) {
            entities.entry(kind).or_default().extend(values);
        }
        let entities_payload = Self::entities_payload(&entities);

        let has = |source: &str| input.available_sources.iter().any(|s| s == source);
        let mut steps = Vec::new();
        let mut query_ids = Vec::new();

        if has("siem") {
            steps.push(Self::step(
                "query-siem",
                "query SIEM for related activity",
                StepType::Query,
                vec![],
                json!({
                    "query": format!("related activity for alert {}", input.alert.alert_id),
                    "entities": entities_payload,
                }),
                vec!["siem".to_string()],
                input,
            ));
            query_ids.push("query-siem".to_string());
        }
        if has("edr") {
            steps.push(Self::step(
                "query-edr",
                "query EDR telemetry",
                StepType::Query,
                vec![],
                json!({
                    "query": format!("endpoint telemetry for alert {}", input.alert.alert_id),
                    "entities": entities_payload,
                }),
                vec!["edr".to_string()],
                input,
            ));
            query_ids.push("query-edr".to_string());
        }
        if has("threat_intel") {
            steps.push(Self::step(
                "enrich-intel",
                "enrich observables with threat intel",
                StepType::Enrich,
                vec![],
                json!({ "entities": entities_payload }),
                vec!["threat_intel".to_string()],
                input,
            ));
            query_ids.push("enrich-intel".to_string());
        }

        // Queries may individually fail without dooming the plan.
        for step in &mut steps {
            step.non_critical = true;
        }

        steps.push(Self::step(
            "correlate",
            "correlate gathered evidence",
            StepType::Correlate,
            query_ids.clone(),
            json!({ "timeWindowMs": 300_000 }),
            vec![],
            input,
        ));
        steps.push(Self::step(
            "validate",
            "validate evidence sufficiency",
            StepType::Validate,
            vec!["correlate".to_string()],
            json!({
                "criteria": [
                    { "evidenceCount": 1 },
                    { "confidenceThreshold": 0.5 },
                ]
            }),
            vec![],
            input,
        ));

        Ok(Plan {
            plan_id: format!("plan-{}", context.investigation_id),
            investigation_id: context.investigation_id.clone(),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentra_types::{Severity, TenantContext};

    fn alert() -> Alert {
        Alert {
            alert_id: "alert-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            title: "Suspicious PowerShell".to_string(),
            severity: Severity::High,
            source: "edr".to_string(),
            timestamp: Utc::now(),
            raw_payload: serde_json::json!({
                "src_ip": "192.168.1.100",
                "dst_ip": "10.0.0.5",
                "process": "powershell.exe",
                "file_hash": "abc123def456",
                "domain": "suspicious.com",
            }),
            entities: EntityMap::new(),
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            tenant: TenantContext::new("tenant-a", "user-1", "corr-1"),
            investigation_id: "inv-1".to_string(),
            run_id: "run-1".to_string(),
        }
    }

    fn input(sources: &[&str]) -> PlannerInput {
        PlannerInput {
            alert: alert(),
            available_sources: sources.iter().map(|s| s.to_string()).collect(),
            step_timeout_ms: 5_000,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn plan_contains_query_and_correlate_steps() {
        let plan = PlannerAgent
            .execute(&context(), &input(&["siem", "edr", "threat_intel"]))
            .await
            .unwrap();
        assert!(plan
            .steps
            .iter()
            .any(|s| s.step_type == StepType::Query && s.data_sources == ["siem"]));
        assert!(plan.steps.iter().any(|s| s.step_type == StepType::Correlate));
        assert!(plan.steps.iter().any(|s| s.step_type == StepType::Validate));
        // The DAG is well formed.
        plan.topo_order().unwrap();
    }

    #[tokio::test]
    async fn correlate_depends_on_all_collection_steps() {
        let plan = PlannerAgent
            .execute(&context(), &input(&["siem", "edr", "threat_intel"]))
            .await
            .unwrap();
        let correlate = plan
            .steps
            .iter()
            .find(|s| s.step_type == StepType::Correlate)
            .unwrap();
        assert_eq!(correlate.dependencies.len(), 3);
    }

    #[tokio::test]
    async fn unavailable_sources_are_planned_around() {
        let plan = PlannerAgent
            .execute(&context(), &input(&["edr", "threat_intel"]))
            .await
            .unwrap();
        assert!(!plan
            .steps
            .iter()
            .any(|s| s.data_sources.contains(&"siem".to_string())));
        let correlate = plan
            .steps
            .iter()
            .find(|s| s.step_type == StepType::Correlate)
            .unwrap();
        assert_eq!(correlate.dependencies.len(), 2);
    }

    #[tokio::test]
    async fn payload_entities_reach_query_steps() {
        let plan = PlannerAgent
            .execute(&context(), &input(&["siem"]))
            .await
            .unwrap();
        let query = plan
            .steps
            .iter()
            .find(|s| s.step_type == StepType::Query)
            .unwrap();
        let ips = query.payload["entities"]["ip"].as_array().unwrap();
        assert!(ips.iter().any(|v| v == "192.168.1.100"));
        let domains = query.payload["entities"]["domain"].as_array().unwrap();
        assert!(domains.iter().any(|v| v == "suspicious.com"));
    }
}
