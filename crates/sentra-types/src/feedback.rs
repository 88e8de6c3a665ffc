use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Human feedback kinds accepted by the orchestrator. Unknown types are
/// rejected at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedbackType {
    VerdictCorrection,
    StepFeedback,
    Note,
    Escalation,
}

impl FeedbackType {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackType::VerdictCorrection => "verdictCorrection",
            FeedbackType::StepFeedback => "stepFeedback",
            FeedbackType::Note => "note",
            FeedbackType::Escalation => "escalation",
        }
    }
}

impl std::str::FromStr for FeedbackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verdictCorrection" => Ok(FeedbackType::VerdictCorrection),
            "stepFeedback" => Ok(FeedbackType::StepFeedback),
            "note" => Ok(FeedbackType::Note),
            "escalation" => Ok(FeedbackType::Escalation),
            other => Err(format!("unknown feedback type: {other}")),
        }
    }
}

/// Append-only feedback row. Not an interrupt: the orchestrator consumes
/// pending feedback at state transitions and between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(rename = "feedbackId")]
    pub feedback_id: String,
    #[serde(rename = "investigationId")]
    pub investigation_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub feedback_type: FeedbackType,
    pub content: Value,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}
