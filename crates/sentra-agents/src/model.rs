//! Isolation seam for AI model calls.
//!
//! The orchestrator treats model output as opaque data: it lands in evidence
//! or in free-text reasoning, never in control flow. Everything else in the
//! agents is deterministic.

use async_trait::async_trait;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Complete a prompt. Implementations are the only non-deterministic
    /// call site in the agent layer.
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Default client: no model configured. Returns a fixed marker so callers
/// fall back to their deterministic summaries.
pub struct NoopModel;

#[async_trait]
impl ModelClient for NoopModel {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }
}
