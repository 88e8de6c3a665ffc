//! Learning feedback hook.
//!
//! Completed investigations feed an external adaptation pipeline. Only the
//! interface lives here; the default sink records structured outcomes.

use async_trait::async_trait;
use sentra_types::{ExecutionSummary, Investigation, Verdict};

/// One completed investigation, as handed to the learning pipeline.
#[derive(Debug, Clone)]
pub struct InvestigationOutcome {
    pub investigation: Investigation,
    pub verdict: Option<Verdict>,
    pub summary: Option<ExecutionSummary>,
    pub feedback_count: usize,
}

#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn investigation_completed(&self, outcome: &InvestigationOutcome);
}

/// Default sink: structured log line per completed investigation.
pub struct TracingLearningSink;

#[async_trait]
impl LearningSink for TracingLearningSink {
    async fn investigation_completed(&self, outcome: &InvestigationOutcome) {
        tracing::info!(
            investigation_id = %outcome.investigation.investigation_id,
            tenant_id = %outcome.investigation.tenant_id,
            status = outcome.investigation.status.as_str(),
            verdict = outcome
                .verdict
                .as_ref()
                .map(|v| v.classification.as_str())
                .unwrap_or("none"),
            feedback_count = outcome.feedback_count,
            "investigation outcome recorded for learning"
        );
    }
}
