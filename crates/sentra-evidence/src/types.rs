// Store types and error taxonomy for the evidence layer.

use chrono::{DateTime, Utc};
use sentra_types::{InvestigationStatus, Severity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound(what.into())
    }
}

/// Filter for investigation listings. The limit is hard-capped at 200.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvestigationFilter {
    pub status: Option<InvestigationStatus>,
    pub severity: Option<Severity>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

pub const LIST_LIMIT_CAP: usize = 200;

impl InvestigationFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(50).min(LIST_LIMIT_CAP)
    }
}

/// Aggregate counters for the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub timeframe: String,
    pub total: u64,
    #[serde(rename = "byStatus")]
    pub by_status: Vec<(String, u64)>,
    #[serde(rename = "bySeverity")]
    pub by_severity: Vec<(String, u64)>,
    /// Mean wall-clock from start to terminal, over terminal investigations.
    #[serde(rename = "meanTimeToVerdictMs")]
    pub mean_time_to_verdict_ms: Option<f64>,
}

/// One persisted run-stream event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub run_id: String,
    pub sequence: i64,
    pub method: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}
