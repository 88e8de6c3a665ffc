// Execution engine: runs a plan's step DAG with bounded parallelism.
//
// A step becomes eligible when every dependency is complete (or terminal and
// non-critical). Eligible steps dispatch into a JoinSet capped at
// `max_parallel_steps`. Failures flow through the classified policy table;
// exhausted steps feed plan adaptation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sentra_connectors::{CallOpts, ConnectorError, ConnectorRegistry};
use sentra_evidence::{
    build_correlations, derive_relationships, extract_entities, extract_techniques,
    score_evidence, CorrelatorConfig, SqliteStore,
};
use sentra_types::{
    Correlation, ErrorKind, Evidence, EvidenceType, ExecutionSummary, Plan, Step, StepStatus,
    StepType, TenantContext,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::mint_id;
use crate::config::EngineConfig;
use crate::event_bus::EventBus;
use sentra_wire::{methods, EventEnvelope};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_parallel_steps: usize,
    pub step_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub adapt_min_failed: usize,
    pub adapt_failed_ratio: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel_steps: 3,
            step_timeout_ms: 5_000,
            max_retry_attempts: 2,
            retry_backoff_ms: 1_000,
            adapt_min_failed: 3,
            adapt_failed_ratio: 0.5,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_parallel_steps: config.max_parallel_steps,
            step_timeout_ms: config.step_timeout_ms,
            max_retry_attempts: config.max_retry_attempts,
            retry_backoff_ms: config.retry_backoff_ms,
            ..Self::default()
        }
    }
}

/// What the engine hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub summary: ExecutionSummary,
    pub correlations: Vec<Correlation>,
    /// `<source>_unavailable` entries for sources that produced nothing.
    pub limitations: Vec<String>,
    /// An auth/permission failure occurred; the investigation escalates.
    pub escalate: bool,
}

#[derive(Debug)]
struct StepOutcome {
    step: Step,
    evidence_added: usize,
    correlations: Vec<Correlation>,
    escalate: bool,
    fatal: Option<String>,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<SqliteStore>,
    registry: ConnectorRegistry,
    bus: EventBus,
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: ConnectorRegistry,
        bus: EventBus,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            settings,
        }
    }

    /// Run the plan to quiescence: every step terminal. Pause withholds new
    /// dispatches at step boundaries; cancellation propagates into in-flight
    /// connector calls.
    pub async fn execute_plan(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        plan: &Plan,
        cancel: CancellationToken,
        mut pause: watch::Receiver<bool>,
    ) -> anyhow::Result<ExecutionOutcome> {
        plan.topo_order()
            .map_err(|err| anyhow::anyhow!("invalid plan: {err}"))?;

        let started = std::time::Instant::now();
        let mut steps: Vec<Step> = plan.steps.clone();
        for step in &steps {
            self.store
                .upsert_step(&tenant.tenant_id, &plan.investigation_id, &plan.plan_id, step)
                .await?;
        }

        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut adapted: HashSet<String> = HashSet::new();
        let mut failing_sources: BTreeSet<String> = BTreeSet::new();
        let mut limitations: BTreeSet<String> = BTreeSet::new();
        let mut adaptations: Vec<String> = Vec::new();
        let mut all_correlations: Vec<Correlation> = Vec::new();
        let mut escalate = false;
        let mut evidence_added = 0_usize;

        loop {
            self.cascade_skips(tenant, plan, &mut steps).await?;

            let all_terminal = steps.iter().all(|s| s.status.is_terminal());
            if all_terminal && join_set.is_empty() {
                break;
            }

            let paused = *pause.borrow();
            if !paused && !cancel.is_cancelled() && !escalate {
                self.dispatch_eligible(
                    tenant,
                    run_id,
                    plan,
                    &mut steps,
                    &mut running,
                    &mut join_set,
                    &cancel,
                )
                .await?;
            }

            if join_set.is_empty() {
                if cancel.is_cancelled() {
                    self.skip_remaining(tenant, plan, &mut steps, "cancelled")
                        .await?;
                    continue;
                }
                if escalate {
                    self.skip_remaining(tenant, plan, &mut steps, "escalated for review")
                        .await?;
                    continue;
                }
                if paused {
                    tokio::select! {
                        _ = pause.changed() => {}
                        _ = cancel.cancelled() => {}
                    }
                    continue;
                }
                // Nothing running and nothing eligible: the cascade pass will
                // resolve or we are done on the next iteration.
                let any_pending = steps.iter().any(|s| s.status == StepStatus::Pending);
                if any_pending {
                    self.skip_remaining(tenant, plan, &mut steps, "unsatisfiable dependencies")
                        .await?;
                }
                continue;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { continue };
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            // A panicked step task is an invariant violation.
                            anyhow::bail!("step task aborted: {err}");
                        }
                    };
                    running.remove(&outcome.step.step_id);
                    if let Some(fatal) = outcome.fatal {
                        anyhow::bail!("fatal step failure: {fatal}");
                    }
                    evidence_added += outcome.evidence_added;
                    all_correlations.extend(outcome.correlations.clone());
                    escalate |= outcome.escalate;

                    let finished = outcome.step;
                    if matches!(finished.status, StepStatus::Failed | StepStatus::Skipped) {
                        for source in &finished.data_sources {
                            failing_sources.insert(source.clone());
                            limitations.insert(format!("{source}_unavailable"));
                        }
                    }
                    if let Some(slot) = steps.iter_mut().find(|s| s.step_id == finished.step_id) {
                        *slot = finished;
                    }

                    self.maybe_adapt(
                        tenant,
                        run_id,
                        plan,
                        &mut steps,
                        &mut adapted,
                        &failing_sources,
                        &mut adaptations,
                    )
                    .await?;
                }
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    // In-flight steps observe the token themselves; loop to
                    // drain them.
                }
                _ = pause.changed() => {}
            }
        }

        let total = steps.len();
        let completed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Complete)
            .count();
        let failed = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
            .count();
        let summary = ExecutionSummary {
            total_steps: total,
            completed_steps: completed,
            failed_steps: failed,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
            total_evidence: evidence_added,
            execution_time_ms: started.elapsed().as_millis() as u64,
            adaptations: adaptations.clone(),
        };

        // Only sources that never delivered remain limitations.
        let delivered: BTreeSet<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Complete)
            .flat_map(|s| s.data_sources.iter().cloned())
            .collect();
        let limitations: Vec<String> = limitations
            .into_iter()
            .filter(|l| {
                let source = l.trim_end_matches("_unavailable");
                !delivered.contains(source)
            })
            .collect();

        info!(
            run_id,
            completed,
            failed,
            evidence = evidence_added,
            "plan execution finished"
        );

        Ok(ExecutionOutcome {
            summary,
            correlations: all_correlations,
            limitations,
            escalate,
        })
    }

    /// Mark pending steps whose critical dependencies already failed.
    async fn cascade_skips(
        &self,
        tenant: &TenantContext,
        plan: &Plan,
        steps: &mut [Step],
    ) -> anyhow::Result<()> {
        loop {
            let mut to_skip: Option<(usize, String)> = None;
            for (index, step) in steps.iter().enumerate() {
                if step.status != StepStatus::Pending {
                    continue;
                }
                for dep_id in &step.dependencies {
                    let Some(dep) = steps.iter().find(|s| &s.step_id == dep_id) else {
                        continue;
                    };
                    let dep_blocks = matches!(dep.status, StepStatus::Failed | StepStatus::Skipped)
                        && !dep.non_critical;
                    if dep_blocks {
                        to_skip = Some((index, dep_id.clone()));
                        break;
                    }
                }
                if to_skip.is_some() {
                    break;
                }
            }
            let Some((index, dep_id)) = to_skip else {
                return Ok(());
            };
            let step = &mut steps[index];
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            step.last_error = Some(format!("dependency {dep_id} failed"));
            self.store
                .upsert_step(&tenant.tenant_id, &plan.investigation_id, &plan.plan_id, step)
                .await?;
            self.publish_step_event(tenant, &plan.investigation_id, step).await;
        }
    }

    async fn skip_remaining(
        &self,
        tenant: &TenantContext,
        plan: &Plan,
        steps: &mut [Step],
        reason: &str,
    ) -> anyhow::Result<()> {
        for step in steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
                step.completed_at = Some(Utc::now());
                step.last_error = Some(reason.to_string());
                self.store
                    .upsert_step(&tenant.tenant_id, &plan.investigation_id, &plan.plan_id, step)
                    .await?;
                self.publish_step_event(tenant, &plan.investigation_id, step).await;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_eligible(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        plan: &Plan,
        steps: &mut [Step],
        running: &mut HashSet<String>,
        join_set: &mut JoinSet<StepOutcome>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        // Deterministic dispatch: declaration order.
        let eligible: Vec<String> = steps
            .iter()
            .filter(|step| {
                step.status == StepStatus::Pending
                    && !running.contains(&step.step_id)
                    && step.dependencies.iter().all(|dep_id| {
                        steps
                            .iter()
                            .find(|s| &s.step_id == dep_id)
                            .map(|dep| {
                                dep.status == StepStatus::Complete
                                    || (dep.status.is_terminal() && dep.non_critical)
                            })
                            .unwrap_or(false)
                    })
            })
            .map(|s| s.step_id.clone())
            .collect();

        for step_id in eligible {
            if running.len() >= self.settings.max_parallel_steps {
                break;
            }
            let Some(step) = steps.iter_mut().find(|s| s.step_id == step_id) else {
                continue;
            };
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            self.store
                .upsert_step(&tenant.tenant_id, &plan.investigation_id, &plan.plan_id, step)
                .await?;
            self.publish_step_event(tenant, &plan.investigation_id, step).await;

            running.insert(step.step_id.clone());
            let runner = StepRunner {
                store: Arc::clone(&self.store),
                registry: self.registry.clone(),
                bus: self.bus.clone(),
                settings: self.settings.clone(),
                tenant: tenant.clone(),
                run_id: run_id.to_string(),
                investigation_id: plan.investigation_id.clone(),
                plan_id: plan.plan_id.clone(),
            };
            let step = step.clone();
            let cancel = cancel.child_token();
            join_set.spawn(async move { runner.run(step, cancel).await });
        }
        Ok(())
    }

    /// Adaptation: once failures cross the threshold, re-plan each failed
    /// step against sources that are still healthy. One adaptation per step.
    #[allow(clippy::too_many_arguments)]
    async fn maybe_adapt(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        plan: &Plan,
        steps: &mut Vec<Step>,
        adapted: &mut HashSet<String>,
        failing_sources: &BTreeSet<String>,
        adaptations: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        let failed: Vec<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed && !s.step_id.ends_with("-alt"))
            .map(|s| s.step_id.clone())
            .collect();
        let threshold_met = failed.len() >= self.settings.adapt_min_failed
            || failed.len() as f64 >= self.settings.adapt_failed_ratio * steps.len() as f64;
        if !threshold_met {
            return Ok(());
        }

        let available = self.registry.available_types(&tenant.tenant_id).await;
        for step_id in failed {
            if adapted.contains(&step_id) {
                continue;
            }
            let Some(original) = steps.iter().find(|s| s.step_id == step_id).cloned() else {
                continue;
            };
            if !matches!(original.step_type, StepType::Query | StepType::Enrich) {
                adapted.insert(step_id);
                continue;
            }
            let alternative_sources: Vec<String> = available
                .iter()
                .filter(|t| !failing_sources.contains(*t))
                .cloned()
                .collect();
            adapted.insert(step_id.clone());
            if alternative_sources.is_empty() {
                continue;
            }

            let alt_id = format!("{step_id}-alt");
            let alt = Step {
                step_id: alt_id.clone(),
                name: format!("{} (adapted)", original.name),
                status: StepStatus::Pending,
                started_at: None,
                completed_at: None,
                retry_count: 0,
                last_error: None,
                data_sources: alternative_sources.clone(),
                ..original
            };
            // Dependents that have not started also wait for the adapted step.
            for step in steps.iter_mut() {
                if step.status == StepStatus::Pending && step.dependencies.contains(&step_id) {
                    step.dependencies.push(alt_id.clone());
                }
            }
            self.store
                .upsert_step(&tenant.tenant_id, &plan.investigation_id, &plan.plan_id, &alt)
                .await?;
            steps.push(alt);
            adaptations.push(step_id.clone());

            let event = EventEnvelope::new(methods::PLAN_ADAPTED, run_id)
                .agent("executor")
                .payload(json!({
                    "stepId": step_id,
                    "alternativeStepId": alt_id,
                    "excludedSources": failing_sources.iter().cloned().collect::<Vec<_>>(),
                    "dataSources": alternative_sources,
                }));
            let _ = self.bus.publish(&tenant.tenant_id, event).await;
            warn!(run_id, step_id = %step_id, "plan adapted after repeated failures");
        }
        Ok(())
    }

    async fn publish_step_event(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        step: &Step,
    ) {
        let event = EventEnvelope::new(methods::item("step"), investigation_id)
            .agent("executor")
            .item(step.step_id.clone())
            .payload(json!({
                "stepId": step.step_id,
                "name": step.name,
                "stepType": step.step_type.as_str(),
                "status": step.status.as_str(),
                "retryCount": step.retry_count,
                "error": step.last_error,
            }));
        let _ = self.bus.publish(&tenant.tenant_id, event).await;
    }
}

/// Everything one spawned step task needs.
struct StepRunner {
    store: Arc<SqliteStore>,
    registry: ConnectorRegistry,
    bus: EventBus,
    settings: EngineSettings,
    tenant: TenantContext,
    run_id: String,
    investigation_id: String,
    plan_id: String,
}

impl StepRunner {
    async fn run(self, mut step: Step, cancel: CancellationToken) -> StepOutcome {
        let mut outcome = StepOutcome {
            step: Step {
                status: StepStatus::Running,
                ..step.clone()
            },
            evidence_added: 0,
            correlations: Vec::new(),
            escalate: false,
            fatal: None,
        };

        if let Err(message) = validate_step(&step) {
            step.status = StepStatus::Failed;
            step.completed_at = Some(Utc::now());
            step.last_error = Some(message);
            return self.finish(step, outcome).await;
        }

        let mut rate_retry_used = false;
        loop {
            let result = self.execute_once(&step, &cancel).await;
            match result {
                Ok((added, correlations)) => {
                    outcome.evidence_added += added;
                    outcome.correlations = correlations;
                    step.status = StepStatus::Complete;
                    step.completed_at = Some(Utc::now());
                    step.last_error = None;
                    return self.finish(step, outcome).await;
                }
                Err(err) => match err.kind {
                    ErrorKind::Fatal => {
                        step.status = StepStatus::Failed;
                        step.completed_at = Some(Utc::now());
                        step.last_error = Some(err.to_string());
                        outcome.fatal = Some(err.to_string());
                        return self.finish(step, outcome).await;
                    }
                    ErrorKind::Auth | ErrorKind::PermissionDenied => {
                        step.status = StepStatus::Failed;
                        step.completed_at = Some(Utc::now());
                        step.last_error = Some(err.to_string());
                        outcome.escalate = true;
                        return self.finish(step, outcome).await;
                    }
                    ErrorKind::Validation
                    | ErrorKind::NotFound
                    | ErrorKind::ConnectorNotFound => {
                        step.status = StepStatus::Failed;
                        step.completed_at = Some(Utc::now());
                        step.last_error = Some(err.to_string());
                        return self.finish(step, outcome).await;
                    }
                    ErrorKind::RateLimit => {
                        if rate_retry_used || cancel.is_cancelled() {
                            step.status = StepStatus::Skipped;
                            step.completed_at = Some(Utc::now());
                            step.last_error =
                                Some(format!("skipped after repeated throttling: {err}"));
                            return self.finish(step, outcome).await;
                        }
                        rate_retry_used = true;
                        let wait = Duration::from_millis(err.retry_after_ms.unwrap_or(1_000));
                        self.publish_retry(&step, &err, wait).await;
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    // Timeout, NetworkTransient, Server5xx, CircuitOpen:
                    // exponential backoff until attempts are exhausted.
                    _ => {
                        if step.retry_count >= step.max_retries || cancel.is_cancelled() {
                            step.status = StepStatus::Failed;
                            step.completed_at = Some(Utc::now());
                            step.last_error = Some(err.to_string());
                            return self.finish(step, outcome).await;
                        }
                        step.retry_count += 1;
                        let backoff = Duration::from_millis(
                            self.settings.retry_backoff_ms
                                * 2_u64.saturating_pow(step.retry_count - 1),
                        );
                        self.publish_retry(&step, &err, backoff).await;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                },
            }
        }
    }

    async fn finish(&self, step: Step, mut outcome: StepOutcome) -> StepOutcome {
        let _ = self
            .store
            .upsert_step(&self.tenant.tenant_id, &self.investigation_id, &self.plan_id, &step)
            .await;
        let event = EventEnvelope::new(methods::item("step"), &self.run_id)
            .agent("executor")
            .item(step.step_id.clone())
            .payload(json!({
                "stepId": step.step_id,
                "name": step.name,
                "stepType": step.step_type.as_str(),
                "status": step.status.as_str(),
                "retryCount": step.retry_count,
                "error": step.last_error,
            }));
        let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
        outcome.step = step;
        outcome
    }

    async fn publish_retry(&self, step: &Step, err: &ConnectorError, wait: Duration) {
        let event = EventEnvelope::new(methods::CONNECTOR_RETRY, &self.run_id)
            .agent("executor")
            .item(step.step_id.clone())
            .payload(json!({
                "stepId": step.step_id,
                "attempt": step.retry_count + 1,
                "kind": err.kind.as_str(),
                "waitMs": wait.as_millis() as u64,
            }));
        let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
    }

    async fn execute_once(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(usize, Vec<Correlation>), ConnectorError> {
        match step.step_type {
            StepType::Query => self.run_query(step, cancel).await.map(|n| (n, Vec::new())),
            StepType::Enrich => self.run_enrich(step, cancel).await.map(|n| (n, Vec::new())),
            StepType::Correlate => self.run_correlate(step).await,
            StepType::Validate => self.run_validate(step).await.map(|_| (0, Vec::new())),
        }
    }

    fn call_opts(&self, step: &Step, cancel: &CancellationToken) -> CallOpts {
        CallOpts::with_cancel(
            Duration::from_millis(step.timeout_ms.max(1)),
            cancel.clone(),
        )
    }

    /// Query sources in declared order; the first success wins. Every source
    /// failing yields the last error as the step error.
    async fn run_query(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<usize, ConnectorError> {
        let mut last_err: Option<ConnectorError> = None;
        for source in &step.data_sources {
            match self
                .registry
                .query(
                    &self.tenant.tenant_id,
                    source,
                    &step.payload,
                    &self.call_opts(step, cancel),
                )
                .await
            {
                Ok(sourced) => {
                    self.publish_failovers(step, &sourced.failovers).await;
                    return self
                        .store_records(step, source, &sourced.result)
                        .await
                        .map_err(|err| {
                            ConnectorError::new(ErrorKind::Fatal, format!("evidence write: {err}"))
                        });
                }
                Err(err) => {
                    let event = EventEnvelope::new(methods::DATA_SOURCE_FAILURE, &self.run_id)
                        .agent("executor")
                        .item(step.step_id.clone())
                        .payload(json!({
                            "stepId": step.step_id,
                            "source": source,
                            "kind": err.kind.as_str(),
                            "error": err.to_string(),
                        }));
                    let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
                    // Unretryable classes surface immediately; otherwise try
                    // the next source.
                    if matches!(
                        err.kind,
                        ErrorKind::Auth
                            | ErrorKind::PermissionDenied
                            | ErrorKind::Validation
                            | ErrorKind::Fatal
                    ) {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ConnectorError::new(ErrorKind::Validation, "query step has no data sources")
        }))
    }

    async fn run_enrich(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<usize, ConnectorError> {
        let source = step
            .data_sources
            .first()
            .cloned()
            .unwrap_or_else(|| "threat_intel".to_string());
        let mut added = 0_usize;
        let mut last_err: Option<ConnectorError> = None;

        let observables: Vec<(String, String)> = ["domain", "hash", "ip"]
            .iter()
            .flat_map(|kind| {
                step.payload
                    .get("entities")
                    .and_then(|e| e.get(*kind))
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str())
                            .map(|v| (kind.to_string(), v.to_string()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect();

        if observables.is_empty() {
            return Ok(0);
        }

        for (kind, value) in observables {
            match self
                .registry
                .enrich(
                    &self.tenant.tenant_id,
                    &source,
                    &value,
                    &kind,
                    &self.call_opts(step, cancel),
                )
                .await
            {
                Ok(sourced) => {
                    self.publish_failovers(step, &sourced.failovers).await;
                    added += self
                        .store_records(step, &source, &json!({ "records": [sourced.result] }))
                        .await
                        .map_err(|err| {
                            ConnectorError::new(ErrorKind::Fatal, format!("evidence write: {err}"))
                        })?;
                }
                Err(err) => {
                    if err.kind.escalates() || err.kind == ErrorKind::Fatal {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        if added == 0 {
            if let Some(err) = last_err {
                return Err(err);
            }
        }
        Ok(added)
    }

    async fn run_correlate(&self, step: &Step) -> Result<(usize, Vec<Correlation>), ConnectorError> {
        let evidence = self
            .store
            .list_evidence(&self.tenant.tenant_id, &self.investigation_id)
            .await
            .map_err(storage_error)?;

        let mut config = CorrelatorConfig::default();
        if let Some(window) = step.payload.get("timeWindowMs").and_then(|v| v.as_u64()) {
            config.time_window_ms = window;
        }

        let relationships = derive_relationships(&evidence, &config);
        for relationship in &relationships {
            self.store
                .insert_relationship(&self.tenant.tenant_id, &self.investigation_id, relationship)
                .await
                .map_err(storage_error)?;
        }
        let correlations = build_correlations(&relationships, &config);

        let mut added = 0_usize;
        for correlation in &correlations {
            let now = Utc::now();
            let evidence_row = Evidence {
                evidence_id: mint_id("ev"),
                investigation_id: self.investigation_id.clone(),
                tenant_id: self.tenant.tenant_id.clone(),
                evidence_type: EvidenceType::Correlation,
                source: "correlator".to_string(),
                timestamp: now,
                payload: json!({
                    "kind": correlation.kind.as_str(),
                    "members": correlation.members,
                    "strength": correlation.strength,
                    "rationale": correlation.rationale,
                }),
                entities: Default::default(),
                confidence: correlation.strength.clamp(0.0, 1.0),
                quality_score: 0.0,
                tags: vec!["correlation".to_string()],
                mitre_techniques: Vec::new(),
            };
            let scored = score_evidence(&evidence_row, &relationships, now);
            let evidence_row = Evidence {
                quality_score: scored.overall,
                ..evidence_row
            };
            self.store
                .insert_evidence(&evidence_row)
                .await
                .map_err(storage_error)?;
            added += 1;

            let event = EventEnvelope::new(methods::item("correlation"), &self.run_id)
                .agent("executor")
                .item(evidence_row.evidence_id.clone())
                .payload(json!({
                    "kind": correlation.kind.as_str(),
                    "members": correlation.members,
                    "strength": correlation.strength,
                }));
            let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
        }

        Ok((added, correlations))
    }

    async fn run_validate(&self, step: &Step) -> Result<(), ConnectorError> {
        let evidence = self
            .store
            .list_evidence(&self.tenant.tenant_id, &self.investigation_id)
            .await
            .map_err(storage_error)?;

        let criteria = step
            .payload
            .get("criteria")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::new();
        let mut valid = true;
        for criterion in &criteria {
            let (name, passed) = evaluate_criterion(criterion, &evidence);
            valid &= passed;
            results.push(json!({ "criterion": name, "passed": passed }));
        }

        let event = EventEnvelope::new(methods::item("validation"), &self.run_id)
            .agent("executor")
            .item(step.step_id.clone())
            .payload(json!({
                "stepId": step.step_id,
                "valid": valid,
                "criteriaResults": results,
            }));
        let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
        Ok(())
    }

    async fn publish_failovers(
        &self,
        step: &Step,
        failovers: &[sentra_connectors::FailoverRecord],
    ) {
        for record in failovers {
            let event = EventEnvelope::new(methods::CONNECTOR_FAILOVER, &self.run_id)
                .agent("executor")
                .item(step.step_id.clone())
                .payload(json!({
                    "stepId": step.step_id,
                    "fromConnector": record.from_connector,
                    "toConnector": record.to_connector,
                    "kind": record.kind.as_str(),
                }));
            let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
        }
    }

    /// Turn a connector result's records into scored evidence rows.
    async fn store_records(
        &self,
        step: &Step,
        source: &str,
        result: &Value,
    ) -> anyhow::Result<usize> {
        let records: Vec<Value> = result
            .get("records")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_else(|| vec![result.clone()]);

        let mut added = 0_usize;
        for record in records {
            let now = Utc::now();
            let entities = extract_entities(&record);
            let techniques = extract_techniques(&record);
            let evidence_type = infer_evidence_type(&record);
            let confidence = record
                .get("reputation")
                .and_then(|v| v.as_f64())
                .map(|r| if r >= 0.8 { 0.9 } else { 0.6 })
                .unwrap_or(0.8);

            let mut evidence = Evidence {
                evidence_id: mint_id("ev"),
                investigation_id: self.investigation_id.clone(),
                tenant_id: self.tenant.tenant_id.clone(),
                evidence_type,
                source: source.to_string(),
                timestamp: now,
                payload: record,
                entities,
                confidence,
                quality_score: 0.0,
                tags: vec![step.step_type.as_str().to_string()],
                mitre_techniques: techniques,
            };
            evidence.quality_score = score_evidence(&evidence, &[], now).overall;
            self.store.insert_evidence(&evidence).await?;
            added += 1;

            let event = EventEnvelope::new(methods::item("evidence"), &self.run_id)
                .agent("executor")
                .item(evidence.evidence_id.clone())
                .payload(json!({
                    "evidenceId": evidence.evidence_id,
                    "stepId": step.step_id,
                    "type": evidence.evidence_type.as_str(),
                    "source": evidence.source,
                    "qualityScore": evidence.quality_score,
                }));
            let _ = self.bus.publish(&self.tenant.tenant_id, event).await;
        }
        Ok(added)
    }
}

fn storage_error(err: sentra_evidence::StoreError) -> ConnectorError {
    ConnectorError::new(ErrorKind::Fatal, format!("store failure: {err}"))
}

fn validate_step(step: &Step) -> Result<(), String> {
    match step.step_type {
        StepType::Query => {
            if step.data_sources.is_empty() {
                return Err("query step requires at least one data source".to_string());
            }
            if !step.payload.is_object() {
                return Err("query step payload must be an object".to_string());
            }
        }
        StepType::Enrich => {
            if step.payload.get("entities").is_none() {
                return Err("enrich step payload requires entities".to_string());
            }
        }
        StepType::Correlate => {}
        StepType::Validate => {
            if step
                .payload
                .get("criteria")
                .and_then(|v| v.as_array())
                .map(|a| a.is_empty())
                .unwrap_or(true)
            {
                return Err("validate step requires non-empty criteria".to_string());
            }
        }
    }
    Ok(())
}

fn infer_evidence_type(record: &Value) -> EvidenceType {
    if record.get("indicator").is_some() || record.get("reputation").is_some() {
        return EvidenceType::Enrichment;
    }
    if record.get("process").is_some() || record.get("command_line").is_some() {
        return EvidenceType::Process;
    }
    if record.get("file_hash").is_some() && record.get("path").is_some() {
        return EvidenceType::File;
    }
    if record.get("src_ip").is_some() || record.get("dst_ip").is_some() {
        return EvidenceType::Network;
    }
    EvidenceType::Log
}

fn evaluate_criterion(criterion: &Value, evidence: &[Evidence]) -> (String, bool) {
    if let Some(min) = criterion.get("evidenceCount").and_then(|v| v.as_u64()) {
        return (
            format!("evidenceCount>={min}"),
            evidence.len() as u64 >= min,
        );
    }
    if let Some(threshold) = criterion.get("confidenceThreshold").and_then(|v| v.as_f64()) {
        let mean = if evidence.is_empty() {
            0.0
        } else {
            evidence.iter().map(|e| e.confidence).sum::<f64>() / evidence.len() as f64
        };
        return (format!("meanConfidence>={threshold}"), mean >= threshold);
    }
    if let Some(presence) = criterion.get("entityPresence") {
        let kind = presence.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        let value = presence.get("value").and_then(|v| v.as_str()).unwrap_or("");
        let present = evidence.iter().any(|e| {
            e.entities
                .get(kind)
                .map(|set| set.contains(value))
                .unwrap_or(false)
        });
        return (format!("entityPresence:{kind}:{value}"), present);
    }
    ("unknown".to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InMemoryEventLog;
    use sentra_connectors::builtin::sim::{SimConnector, SimProfile};
    use sentra_connectors::{Connector, ConnectorRegistry, RegistryConfig};
    use sentra_types::{AuthSpec, ConnectorDefinition, RateLimits};
    use tempfile::TempDir;

    struct Fixture {
        engine: ExecutionEngine,
        store: Arc<SqliteStore>,
        bus: EventBus,
        sims: HashMap<String, Arc<SimConnector>>,
        _tmp: TempDir,
    }

    async fn fixture(types: &[&str]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::new(&tmp.path().join("sentra.db")).await.unwrap());
        let bus = EventBus::new(Arc::new(InMemoryEventLog::new()), 200);
        let registry = ConnectorRegistry::new(RegistryConfig::default());
        let mut sims = HashMap::new();
        for connector_type in types {
            let sim = Arc::new(SimConnector::new(
                connector_type.to_string(),
                SimProfile::default(),
            ));
            sims.insert(connector_type.to_string(), Arc::clone(&sim));
            let for_factory = Arc::clone(&sim);
            registry
                .register_factory(
                    connector_type.to_string(),
                    Arc::new(move |_| Ok(for_factory.clone() as Arc<dyn Connector>)),
                )
                .await;
            registry
                .install(ConnectorDefinition {
                    connector_id: format!("{connector_type}-primary"),
                    tenant_id: "tenant-a".to_string(),
                    connector_type: connector_type.to_string(),
                    priority: 1,
                    auth: AuthSpec::default(),
                    rate_limits: RateLimits::default(),
                    settings: json!({}),
                })
                .await
                .unwrap();
        }
        let settings = EngineSettings {
            retry_backoff_ms: 1,
            ..EngineSettings::default()
        };
        let engine = ExecutionEngine::new(Arc::clone(&store), registry, bus.clone(), settings);
        Fixture {
            engine,
            store,
            bus,
            sims,
            _tmp: tmp,
        }
    }

    fn tenant() -> TenantContext {
        TenantContext::new("tenant-a", "user-1", "corr-1")
    }

    fn query_step(id: &str, source: &str, deps: &[&str]) -> Step {
        Step {
            step_id: id.to_string(),
            name: format!("query {source}"),
            step_type: StepType::Query,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            payload: json!({
                "query": "pivot",
                "entities": {"ip": ["192.168.1.100", "10.0.0.5"], "hash": ["abc123def456"], "domain": ["suspicious.com"], "process": ["powershell.exe"]},
            }),
            data_sources: vec![source.to_string()],
            timeout_ms: 5_000,
            max_retries: 2,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            non_critical: true,
        }
    }

    fn correlate_step(deps: &[&str]) -> Step {
        Step {
            step_id: "correlate".to_string(),
            name: "correlate".to_string(),
            step_type: StepType::Correlate,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            payload: json!({"timeWindowMs": 300_000}),
            data_sources: vec![],
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

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            plan_id: "plan-1".to_string(),
            investigation_id: "inv-1".to_string(),
            steps,
        }
    }

    fn unpaused() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test run.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn executes_dag_and_stores_evidence() {
        let fx = fixture(&["siem", "edr"]).await;
        let plan = plan(vec![
            query_step("q-siem", "siem", &[]),
            query_step("q-edr", "edr", &[]),
            correlate_step(&["q-siem", "q-edr"]),
        ]);
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();

        assert_eq!(outcome.summary.completed_steps, 3);
        assert_eq!(outcome.summary.failed_steps, 0);
        assert!(outcome.summary.total_evidence > 0);
        assert!(outcome.limitations.is_empty());

        let evidence = fx.store.list_evidence("tenant-a", "inv-1").await.unwrap();
        assert!(evidence.iter().any(|e| e.source == "siem"));
        assert!(evidence.iter().any(|e| e.source == "edr"));

        // Correlations were derived and persisted.
        let relationships = fx
            .store
            .list_relationships("tenant-a", "inv-1")
            .await
            .unwrap();
        assert!(!relationships.is_empty());
        assert!(!outcome.correlations.is_empty());
    }

    #[tokio::test]
    async fn dependencies_gate_step_start() {
        let fx = fixture(&["siem"]).await;
        let plan = plan(vec![
            query_step("first", "siem", &[]),
            query_step("second", "siem", &["first"]),
        ]);
        fx.engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();

        let steps = fx.store.list_steps("tenant-a", "inv-1").await.unwrap();
        let first = steps.iter().find(|s| s.step_id == "first").unwrap();
        let second = steps.iter().find(|s| s.step_id == "second").unwrap();
        assert_eq!(first.status, StepStatus::Complete);
        assert_eq!(second.status, StepStatus::Complete);
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff_then_succeed() {
        let fx = fixture(&["siem"]).await;
        fx.sims["siem"].fail_next(ErrorKind::NetworkTransient, 2);
        let plan = plan(vec![query_step("q", "siem", &[])]);
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();
        assert_eq!(outcome.summary.completed_steps, 1);

        let steps = fx.store.list_steps("tenant-a", "inv-1").await.unwrap();
        assert_eq!(steps[0].retry_count, 2);

        let events = fx.bus.events_after("inv-1", 0, 1_000).await.unwrap();
        let retries = events
            .iter()
            .filter(|e| e.method == methods::CONNECTOR_RETRY)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_step_and_record_limitation() {
        let fx = fixture(&["siem", "edr"]).await;
        fx.sims["siem"].fail_next(ErrorKind::Server5xx, 100);
        let plan = plan(vec![
            query_step("q-siem", "siem", &[]),
            query_step("q-edr", "edr", &[]),
        ]);
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();
        assert_eq!(outcome.summary.failed_steps, 1);
        assert!(outcome
            .limitations
            .iter()
            .any(|l| l == "siem_unavailable"));
        assert!(!outcome.limitations.iter().any(|l| l == "edr_unavailable"));
    }

    #[tokio::test]
    async fn rate_limit_retries_once_then_skips() {
        let fx = fixture(&["siem"]).await;
        fx.sims["siem"].fail_next(ErrorKind::RateLimit, 100);
        let plan = plan(vec![query_step("q", "siem", &[])]);
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();
        let steps = fx.store.list_steps("tenant-a", "inv-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Skipped);
        assert!(steps[0].last_error.as_ref().unwrap().contains("throttling"));
        assert_eq!(outcome.summary.failed_steps, 1);
    }

    #[tokio::test]
    async fn auth_failure_escalates() {
        let fx = fixture(&["siem"]).await;
        fx.sims["siem"].fail_next(ErrorKind::Auth, 1);
        let plan = plan(vec![query_step("q", "siem", &[])]);
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();
        assert!(outcome.escalate);
    }

    #[tokio::test]
    async fn critical_dependency_failure_cascades_to_skip() {
        let fx = fixture(&["siem"]).await;
        fx.sims["siem"].fail_next(ErrorKind::Server5xx, 100);
        let mut first = query_step("first", "siem", &[]);
        first.non_critical = false;
        let plan = plan(vec![first, query_step("second", "siem", &["first"])]);
        fx.engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();
        let steps = fx.store.list_steps("tenant-a", "inv-1").await.unwrap();
        let second = steps.iter().find(|s| s.step_id == "second").unwrap();
        assert_eq!(second.status, StepStatus::Skipped);
        assert!(second.last_error.as_ref().unwrap().contains("dependency"));
    }

    #[tokio::test]
    async fn repeated_failures_trigger_adaptation_to_healthy_sources() {
        let fx = fixture(&["siem", "edr"]).await;
        fx.sims["siem"].fail_next(ErrorKind::Server5xx, 100);
        let plan = plan(vec![
            query_step("q-siem", "siem", &[]),
            correlate_step(&["q-siem"]),
        ]);
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();

        assert_eq!(outcome.summary.adaptations, vec!["q-siem"]);
        let steps = fx.store.list_steps("tenant-a", "inv-1").await.unwrap();
        let alt = steps.iter().find(|s| s.step_id == "q-siem-alt").unwrap();
        assert_eq!(alt.status, StepStatus::Complete);
        assert_eq!(alt.data_sources, vec!["edr"]);

        let events = fx.bus.events_after("inv-1", 0, 1_000).await.unwrap();
        assert!(events.iter().any(|e| e.method == methods::PLAN_ADAPTED));
    }

    #[tokio::test]
    async fn cancellation_skips_pending_steps_and_keeps_partial_evidence() {
        let fx = fixture(&["siem"]).await;
        let cancel = CancellationToken::new();
        let plan = plan(vec![
            query_step("first", "siem", &[]),
            query_step("second", "siem", &["first"]),
        ]);

        // Cancel after the first step completes by pre-cancelling between
        // dispatch rounds: run with an already-cancelled token.
        cancel.cancel();
        let outcome = fx
            .engine
            .execute_plan(&tenant(), "inv-1", &plan, cancel, unpaused())
            .await
            .unwrap();
        let steps = fx.store.list_steps("tenant-a", "inv-1").await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert_eq!(outcome.summary.completed_steps, 0);
    }

    #[tokio::test]
    async fn validate_step_reports_criteria() {
        let fx = fixture(&["siem"]).await;
        let validate = Step {
            step_id: "validate".to_string(),
            name: "validate".to_string(),
            step_type: StepType::Validate,
            dependencies: vec!["q".to_string()],
            payload: json!({
                "criteria": [
                    {"evidenceCount": 1},
                    {"entityPresence": {"kind": "ip", "value": "192.168.1.100"}},
                ]
            }),
            data_sources: vec![],
            timeout_ms: 5_000,
            max_retries: 0,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            non_critical: false,
        };
        let plan = plan(vec![query_step("q", "siem", &[]), validate]);
        fx.engine
            .execute_plan(&tenant(), "inv-1", &plan, CancellationToken::new(), unpaused())
            .await
            .unwrap();

        let events = fx.bus.events_after("inv-1", 0, 1_000).await.unwrap();
        let validation = events
            .iter()
            .find(|e| e.method == "item/validation")
            .unwrap();
        let params = validation.payload.get("params").unwrap();
        assert_eq!(params.get("valid"), Some(&json!(true)));
    }
}
