use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Severity;

/// Investigation lifecycle status.
///
/// Transitions follow the orchestrator state machine; terminal states are
/// immutable except for appended feedback and audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvestigationStatus {
    Queued,
    Planning,
    Executing,
    Analyzing,
    Responding,
    AwaitingApproval,
    Paused,
    Complete,
    RequiresReview,
    Failed,
    TimedOut,
}

impl InvestigationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvestigationStatus::Complete
                | InvestigationStatus::RequiresReview
                | InvestigationStatus::Failed
                | InvestigationStatus::TimedOut
        )
    }

    /// States in which the investigation occupies an active-concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InvestigationStatus::Planning
                | InvestigationStatus::Executing
                | InvestigationStatus::Analyzing
                | InvestigationStatus::Responding
                | InvestigationStatus::AwaitingApproval
                | InvestigationStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvestigationStatus::Queued => "queued",
            InvestigationStatus::Planning => "planning",
            InvestigationStatus::Executing => "executing",
            InvestigationStatus::Analyzing => "analyzing",
            InvestigationStatus::Responding => "responding",
            InvestigationStatus::AwaitingApproval => "awaitingApproval",
            InvestigationStatus::Paused => "paused",
            InvestigationStatus::Complete => "complete",
            InvestigationStatus::RequiresReview => "requiresReview",
            InvestigationStatus::Failed => "failed",
            InvestigationStatus::TimedOut => "timedOut",
        }
    }
}

impl std::fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvestigationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(InvestigationStatus::Queued),
            "planning" => Ok(InvestigationStatus::Planning),
            "executing" => Ok(InvestigationStatus::Executing),
            "analyzing" => Ok(InvestigationStatus::Analyzing),
            "responding" => Ok(InvestigationStatus::Responding),
            "awaitingApproval" => Ok(InvestigationStatus::AwaitingApproval),
            "paused" => Ok(InvestigationStatus::Paused),
            "complete" => Ok(InvestigationStatus::Complete),
            "requiresReview" => Ok(InvestigationStatus::RequiresReview),
            "failed" => Ok(InvestigationStatus::Failed),
            "timedOut" => Ok(InvestigationStatus::TimedOut),
            other => Err(format!("unknown investigation status: {other}")),
        }
    }
}

/// A unit of investigative work triggered by an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    #[serde(rename = "investigationId")]
    pub investigation_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "alertId")]
    pub alert_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    /// 1..=5, higher admitted first.
    pub priority: u8,
    pub severity: Severity,
    pub status: InvestigationStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub metadata: Value,
}

/// Typed unit of work inside a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Query,
    Enrich,
    Correlate,
    Validate,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Query => "query",
            StepType::Enrich => "enrich",
            StepType::Correlate => "correlate",
            StepType::Validate => "validate",
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(StepType::Query),
            "enrich" => Ok(StepType::Enrich),
            "correlate" => Ok(StepType::Correlate),
            "validate" => Ok(StepType::Validate),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Complete | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "complete" => Ok(StepStatus::Complete),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// A step in an investigation plan. Dependencies reference sibling step ids
/// and the resulting graph must be acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "stepId")]
    pub step_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "dataSources", default)]
    pub data_sources: Vec<String>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    pub status: StepStatus,
    #[serde(rename = "startedAt")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    /// When true a skipped step still satisfies downstream dependencies.
    #[serde(rename = "nonCritical", default)]
    pub non_critical: bool,
}

/// A DAG of steps owned by a single investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "planId")]
    pub plan_id: String,
    #[serde(rename = "investigationId")]
    pub investigation_id: String,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Validate acyclicity and dependency references. Returns the topological
    /// ordering when the graph is well formed.
    pub fn topo_order(&self) -> Result<Vec<String>, String> {
        use std::collections::{HashMap, VecDeque};

        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            indegree.entry(step.step_id.as_str()).or_insert(0);
            for dep in &step.dependencies {
                if !self.steps.iter().any(|s| &s.step_id == dep) {
                    return Err(format!(
                        "step {} depends on unknown step {}",
                        step.step_id, dep
                    ));
                }
                *indegree.entry(step.step_id.as_str()).or_insert(0) += 1;
                edges.entry(dep.as_str()).or_default().push(&step.step_id);
            }
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for next in edges.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err("plan dependency graph contains a cycle".to_string());
        }
        // Keep declaration order stable for steps at equal depth.
        order.sort_by_key(|id| self.steps.iter().position(|s| &s.step_id == id));
        Ok(order)
    }
}

/// Analyst classification of the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictClass {
    TruePositive,
    FalsePositive,
    RequiresReview,
}

impl VerdictClass {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictClass::TruePositive => "true_positive",
            VerdictClass::FalsePositive => "false_positive",
            VerdictClass::RequiresReview => "requires_review",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub classification: VerdictClass,
    /// [0,1]; capped below 0.8 when any required source was unavailable.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub limitations: Vec<String>,
}

/// Priority attached to a response recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub action: String,
    pub priority: RecommendationPriority,
    #[serde(rename = "requiresApproval", default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub rationale: String,
}

/// Engine-produced roll-up emitted when a plan finishes executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    #[serde(rename = "totalSteps")]
    pub total_steps: usize,
    #[serde(rename = "completedSteps")]
    pub completed_steps: usize,
    #[serde(rename = "failedSteps")]
    pub failed_steps: usize,
    #[serde(rename = "successRate")]
    pub success_rate: f64,
    #[serde(rename = "totalEvidence")]
    pub total_evidence: usize,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub adaptations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            step_id: id.to_string(),
            name: id.to_string(),
            step_type: StepType::Query,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            payload: json!({}),
            data_sources: vec!["siem".to_string()],
            timeout_ms: 5_000,
            max_retries: 2,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            non_critical: false,
        }
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let plan = Plan {
            plan_id: "p1".to_string(),
            investigation_id: "inv1".to_string(),
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])],
        };
        let order = plan.topo_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_order_rejects_cycles() {
        let plan = Plan {
            plan_id: "p1".to_string(),
            investigation_id: "inv1".to_string(),
            steps: vec![step("a", &["b"]), step("b", &["a"])],
        };
        assert!(plan.topo_order().is_err());
    }

    #[test]
    fn topo_order_rejects_unknown_dependency() {
        let plan = Plan {
            plan_id: "p1".to_string(),
            investigation_id: "inv1".to_string(),
            steps: vec![step("a", &["ghost"])],
        };
        assert!(plan.topo_order().is_err());
    }

    #[test]
    fn status_serializes_with_camel_case_terminals() {
        let s = serde_json::to_string(&InvestigationStatus::AwaitingApproval).unwrap();
        assert_eq!(s, "\"awaitingApproval\"");
        let s = serde_json::to_string(&InvestigationStatus::TimedOut).unwrap();
        assert_eq!(s, "\"timedOut\"");
    }
}
