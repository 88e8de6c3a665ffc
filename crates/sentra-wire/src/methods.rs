//! Event method names emitted on the run stream.

pub const RUN_STARTED: &str = "run/started";
pub const RUN_COMPLETED: &str = "run/completed";
pub const RUN_FAILED: &str = "run/failed";
pub const RUN_METRICS: &str = "run/metrics";

pub const ARTIFACT_CREATED: &str = "artifact/created";

pub const APPROVAL_REQUESTED: &str = "approval/requested";
pub const APPROVAL_APPROVED: &str = "approval/approved";
pub const APPROVAL_REJECTED: &str = "approval/rejected";
pub const APPROVAL_EXPIRED: &str = "approval/expired";

pub const PLAN_ADAPTED: &str = "plan_adapted";
pub const CONNECTOR_FAILOVER: &str = "connector_failover";
pub const CONNECTOR_RETRY: &str = "connector_retry";
pub const DATA_SOURCE_FAILURE: &str = "data_source_failure";
pub const INVESTIGATION_TIMEOUT: &str = "investigation_timeout";
pub const INVESTIGATION_CLEANUP: &str = "investigation_cleanup";
pub const INVESTIGATION_PAUSED: &str = "investigation_paused";
pub const INVESTIGATION_RESUMED: &str = "investigation_resumed";

/// `turn/<agent>/started`
pub fn turn_started(agent: &str) -> String {
    format!("turn/{agent}/started")
}

/// `turn/<agent>/completed`
pub fn turn_completed(agent: &str) -> String {
    format!("turn/{agent}/completed")
}

/// `turn/<agent>/failed`
pub fn turn_failed(agent: &str) -> String {
    format!("turn/{agent}/failed")
}

/// `item/<type>`, e.g. `item/evidence`, `item/step`.
pub fn item(kind: &str) -> String {
    format!("item/{kind}")
}
