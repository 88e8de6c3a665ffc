pub mod analyst;
pub mod model;
pub mod planner;
pub mod responder;

pub use analyst::*;
pub use model::*;
pub use planner::*;
pub use responder::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sentra_types::TenantContext;
use serde::{Deserialize, Serialize};

/// Request-scoped context handed to every agent execution.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub tenant: TenantContext,
    pub investigation_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// The agent contract: validate input, then execute.
///
/// Implementations are deterministic given `(context, input)`; anything
/// non-deterministic (an AI model call) sits behind [`model::ModelClient`]
/// and its output is treated as evidence, not logic.
#[async_trait]
pub trait Agent: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    fn validate(&self, input: &Self::Input) -> ValidationReport;

    async fn execute(
        &self,
        context: &AgentContext,
        input: &Self::Input,
    ) -> anyhow::Result<Self::Output>;
}

/// Outcome of a harnessed agent run.
#[derive(Debug)]
pub struct AgentRun<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            timeout: Duration::from_millis(30_000),
            backoff_base: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    #[serde(rename = "totalExecutions")]
    pub total_executions: u64,
    pub successful: u64,
    pub failed: u64,
    pub retries: u64,
    #[serde(rename = "successRate")]
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    retries: u64,
}

/// Shared retry/timeout/metrics wrapper for all agents.
#[derive(Clone, Default)]
pub struct AgentHarness {
    counters: Arc<Mutex<HashMap<&'static str, Counters>>>,
}

impl AgentHarness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, then execute with a per-attempt timeout and linear backoff
    /// between attempts. Validation failures never retry.
    pub async fn run<A: Agent>(
        &self,
        agent: &A,
        context: &AgentContext,
        input: &A::Input,
        config: &HarnessConfig,
    ) -> AgentRun<A::Output> {
        let report = agent.validate(input);
        if !report.valid {
            self.record(agent.name(), false, 0);
            return AgentRun {
                success: false,
                result: None,
                error: Some(format!(
                    "validation failed: {}",
                    report.errors.join("; ")
                )),
                attempts: 0,
            };
        }

        let mut attempts = 0_u32;
        let mut last_error = String::new();
        while attempts < config.max_attempts.max(1) {
            attempts += 1;
            match tokio::time::timeout(config.timeout, agent.execute(context, input)).await {
                Ok(Ok(output)) => {
                    self.record(agent.name(), true, attempts.saturating_sub(1) as u64);
                    return AgentRun {
                        success: true,
                        result: Some(output),
                        error: None,
                        attempts,
                    };
                }
                Ok(Err(err)) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        agent = agent.name(),
                        attempt = attempts,
                        error = %err,
                        "agent execution failed"
                    );
                }
                Err(_) => {
                    last_error = format!(
                        "agent {} timed out after {}ms",
                        agent.name(),
                        config.timeout.as_millis()
                    );
                    tracing::warn!(agent = agent.name(), attempt = attempts, "agent timed out");
                }
            }
            if attempts < config.max_attempts {
                tokio::time::sleep(config.backoff_base * attempts).await;
            }
        }

        self.record(agent.name(), false, attempts.saturating_sub(1) as u64);
        AgentRun {
            success: false,
            result: None,
            error: Some(last_error),
            attempts,
        }
    }

    fn record(&self, name: &'static str, success: bool, retries: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.entry(name).or_default();
        entry.total += 1;
        entry.retries += retries;
        if success {
            entry.successful += 1;
        } else {
            entry.failed += 1;
        }
    }

    pub fn metrics(&self, name: &str) -> AgentMetrics {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .get(name)
            .map(|c| AgentMetrics {
                total_executions: c.total,
                successful: c.successful,
                failed: c.failed,
                retries: c.retries,
                success_rate: if c.total > 0 {
                    c.successful as f64 / c.total as f64
                } else {
                    0.0
                },
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAgent {
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &'static str {
            "flaky"
        }

        fn validate(&self, input: &u32) -> ValidationReport {
            if *input == 0 {
                ValidationReport::invalid(vec!["input must be nonzero".to_string()])
            } else {
                ValidationReport::ok()
            }
        }

        async fn execute(&self, _context: &AgentContext, input: &u32) -> anyhow::Result<u32> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient failure")
            }
            Ok(input * 2)
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
    async fn validation_failure_short_circuits() {
        let harness = AgentHarness::new();
        let agent = FlakyAgent {
            fail_first: AtomicU32::new(0),
        };
        let run = harness
            .run(&agent, &context(), &0, &HarnessConfig::default())
            .await;
        assert!(!run.success);
        assert_eq!(run.attempts, 0);
        assert!(run.error.unwrap().contains("validation failed"));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let harness = AgentHarness::new();
        let agent = FlakyAgent {
            fail_first: AtomicU32::new(1),
        };
        let config = HarnessConfig {
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
        };
        let run = harness.run(&agent, &context(), &21, &config).await;
        assert!(run.success);
        assert_eq!(run.result, Some(42));
        assert_eq!(run.attempts, 2);

        let metrics = harness.metrics("flaky");
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.retries, 1);
        assert!((metrics.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn exhausted_attempts_report_failure() {
        let harness = AgentHarness::new();
        let agent = FlakyAgent {
            fail_first: AtomicU32::new(10),
        };
        let config = HarnessConfig {
            max_attempts: 2,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
        };
        let run = harness.run(&agent, &context(), &1, &config).await;
        assert!(!run.success);
        assert_eq!(run.attempts, 2);
        let metrics = harness.metrics("flaky");
        assert_eq!(metrics.failed, 1);
    }
}
