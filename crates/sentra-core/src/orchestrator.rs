// Orchestrator: per-investigation state machine, priority admission queue,
// concurrency cap, timeout manager, and human-feedback injection.
//
// Feedback is never an interrupt. Pending rows are consumed at state-machine
// transitions and between steps; verdict corrections re-run the analyst and
// responder with the correction appended to context.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sentra_agents::{
    AgentContext, AgentHarness, AnalystAgent, AnalystInput, HarnessConfig, PlannerAgent,
    PlannerInput, ResponderAgent, ResponderInput, ResponsePlan,
};
use sentra_connectors::ConnectorRegistry;
use sentra_evidence::{
    build_correlations, CorrelatorConfig, InvestigationFilter, SqliteStore, StatsReport,
    StoreError,
};
use sentra_types::{
    Alert, Feedback, FeedbackType, Investigation, InvestigationStatus, Plan, Severity, Step,
    TenantContext, Verdict, VerdictClass,
};
use sentra_wire::{
    methods, ApprovalRequest, ApprovalSeed, ApprovalStatus, EventEnvelope,
};
use serde_json::{json, Value};
use sentra_observability::{emit_event, ObservabilityEvent, ProcessKind};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::cancellation::CancellationRegistry;
use crate::clock::{idempotency_key, mint_id, Clock};
use crate::config::{EngineConfig, TenantSettingsCache};
use crate::engine::{ExecutionEngine, ExecutionOutcome};
use crate::event_bus::EventBus;
use crate::learning::{InvestigationOutcome, LearningSink};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => OrchestratorError::NotFound(what),
            StoreError::Conflict(what) => OrchestratorError::Conflict(what),
            other => OrchestratorError::Internal(other.into()),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub alert_id: String,
    pub priority: Option<u8>,
    pub timeout_ms: Option<u64>,
    /// Scopes idempotency; omitted means "per alert".
    pub correlation_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartResponse {
    pub investigation_id: String,
    pub status: InvestigationStatus,
}

#[derive(Debug, Clone)]
pub struct StatusView {
    pub status: InvestigationStatus,
    pub progress: u8,
    pub current_agent: Option<&'static str>,
    pub steps: Vec<Step>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub estimated_completion: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TimelineRow {
    pub name: String,
    pub agent: &'static str,
    pub status: String,
    #[serde(rename = "startedAt")]
    pub started_at: Option<chrono::DateTime<Utc>>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<chrono::DateTime<Utc>>,
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<i64>,
    pub retries: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportSummary {
    #[serde(rename = "totalSteps")]
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(rename = "totalRetries")]
    pub total_retries: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<i64>,
    pub summary: ReportSummary,
    pub timeline: Vec<TimelineRow>,
    pub feedback: Vec<Feedback>,
    pub verdict: Option<Verdict>,
}

struct QueueEntry {
    tenant: TenantContext,
    investigation_id: String,
    priority: u8,
    enqueued_seq: u64,
}

struct ActiveHandle {
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    resume_status: std::sync::Mutex<InvestigationStatus>,
    deadline_tx: watch::Sender<tokio::time::Instant>,
    timeout_guard: CancellationToken,
}

struct PendingApproval {
    request: ApprovalRequest,
    tenant_id: String,
    decision_tx: watch::Sender<ApprovalStatus>,
}

struct Inner {
    store: Arc<SqliteStore>,
    bus: EventBus,
    registry: ConnectorRegistry,
    engine: ExecutionEngine,
    harness: AgentHarness,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    learning: Arc<dyn LearningSink>,
    cancellations: CancellationRegistry,
    tenant_settings: TenantSettingsCache,
    queue: Mutex<Vec<QueueEntry>>,
    active: Mutex<HashMap<String, ActiveHandle>>,
    approvals: Mutex<HashMap<String, PendingApproval>>,
    enqueue_counter: std::sync::atomic::AtomicU64,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        bus: EventBus,
        registry: ConnectorRegistry,
        engine: ExecutionEngine,
        harness: AgentHarness,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        learning: Arc<dyn LearningSink>,
        tenant_settings: TenantSettingsCache,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                registry,
                engine,
                harness,
                config,
                clock,
                learning,
                cancellations: CancellationRegistry::new(),
                tenant_settings,
                queue: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                approvals: Mutex::new(HashMap::new()),
                enqueue_counter: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn bus(&self) -> EventBus {
        self.inner.bus.clone()
    }

    pub fn registry(&self) -> ConnectorRegistry {
        self.inner.registry.clone()
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Idempotent per `(tenant, alert, correlation key)`.
    pub async fn start_investigation(
        &self,
        tenant: &TenantContext,
        request: StartRequest,
    ) -> OrchestratorResult<StartResponse> {
        if request.alert_id.is_empty() {
            return Err(OrchestratorError::Validation("alert id is required".into()));
        }
        if let Some(priority) = request.priority {
            if !(1..=5).contains(&priority) {
                return Err(OrchestratorError::Validation(
                    "priority must be between 1 and 5".into(),
                ));
            }
        }

        let alert = self
            .inner
            .store
            .get_alert(&tenant.tenant_id, &request.alert_id)
            .await?;

        let correlation_key = request.correlation_key.clone().unwrap_or_default();
        let key = idempotency_key(&tenant.tenant_id, &request.alert_id, &correlation_key);
        if let Some(existing) = self
            .inner
            .store
            .lookup_idempotency(&tenant.tenant_id, &key)
            .await?
        {
            let investigation = self
                .inner
                .store
                .get_investigation(&tenant.tenant_id, &existing)
                .await?;
            return Ok(StartResponse {
                investigation_id: existing,
                status: investigation.status,
            });
        }

        let investigation_id = mint_id("inv");
        self.inner
            .store
            .insert_idempotency(&tenant.tenant_id, &key, &investigation_id)
            .await?;
        // Another starter may have won the race.
        if let Some(winner) = self
            .inner
            .store
            .lookup_idempotency(&tenant.tenant_id, &key)
            .await?
        {
            if winner != investigation_id {
                let investigation = self
                    .inner
                    .store
                    .get_investigation(&tenant.tenant_id, &winner)
                    .await?;
                return Ok(StartResponse {
                    investigation_id: winner,
                    status: investigation.status,
                });
            }
        }

        let priority = request
            .priority
            .unwrap_or_else(|| default_priority(alert.severity));
        let settings = self.inner.tenant_settings.get(&tenant.tenant_id).await;
        let timeout_ms = request.timeout_ms.unwrap_or(
            settings
                .default_investigation_timeout_ms
                .unwrap_or(self.inner.config.default_investigation_timeout_ms),
        );

        let investigation = Investigation {
            investigation_id: investigation_id.clone(),
            tenant_id: tenant.tenant_id.clone(),
            alert_id: alert.alert_id.clone(),
            user_id: tenant.user_id.clone(),
            priority,
            severity: alert.severity,
            status: InvestigationStatus::Queued,
            created_at: self.inner.clock.now(),
            started_at: None,
            completed_at: None,
            timeout_ms,
            metadata: json!({"correlationId": tenant.correlation_id}),
        };
        self.inner.store.insert_investigation(&investigation).await?;

        let seq = self
            .inner
            .enqueue_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner.queue.lock().await.push(QueueEntry {
            tenant: tenant.clone(),
            investigation_id: investigation_id.clone(),
            priority,
            enqueued_seq: seq,
        });
        info!(
            investigation_id = %investigation_id,
            tenant_id = %tenant.tenant_id,
            priority,
            "investigation queued"
        );

        self.try_admit().await;
        Ok(StartResponse {
            investigation_id,
            status: InvestigationStatus::Queued,
        })
    }

    /// Admit queued investigations while capacity allows: highest priority
    /// first, FIFO within a priority. When the queue exceeds its soft limit,
    /// low-priority work waits for drain.
    #[async_recursion::async_recursion]
    async fn try_admit(&self) {
        loop {
            let entry = {
                let active = self.inner.active.lock().await;
                if active.len() >= self.inner.config.max_concurrent_investigations {
                    return;
                }
                drop(active);

                let mut queue = self.inner.queue.lock().await;
                let backlogged = queue.len() > self.inner.config.queue_soft_limit;
                let mut best: Option<usize> = None;
                for (index, entry) in queue.iter().enumerate() {
                    if backlogged && entry.priority <= 2 {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some(current) => {
                            let current = &queue[current];
                            entry.priority > current.priority
                                || (entry.priority == current.priority
                                    && entry.enqueued_seq < current.enqueued_seq)
                        }
                    };
                    if better {
                        best = Some(index);
                    }
                }
                match best {
                    Some(index) => queue.remove(index),
                    None => return,
                }
            };

            let admitted = self.admit(entry).await;
            if !admitted {
                return;
            }
        }
    }

    /// Reserve a slot and spawn the run task. Returns false when the slot
    /// race was lost (entry is re-queued).
    #[async_recursion::async_recursion]
    async fn admit(&self, entry: QueueEntry) -> bool {
        let (pause_tx, pause_rx) = watch::channel(false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3_600);
        let (deadline_tx, deadline_rx) = watch::channel(deadline);
        let handle = ActiveHandle {
            cancel: CancellationToken::new(),
            pause_tx,
            resume_status: std::sync::Mutex::new(InvestigationStatus::Executing),
            deadline_tx,
            timeout_guard: CancellationToken::new(),
        };
        {
            let mut active = self.inner.active.lock().await;
            if active.len() >= self.inner.config.max_concurrent_investigations {
                self.inner.queue.lock().await.push(entry);
                return false;
            }
            active.insert(entry.investigation_id.clone(), handle);
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let investigation_id = entry.investigation_id.clone();
            let tenant = entry.tenant.clone();
            if let Err(err) = orchestrator
                .drive(entry.tenant, entry.investigation_id, pause_rx, deadline_rx)
                .await
            {
                error!(
                    investigation_id = %investigation_id,
                    error = %err,
                    "investigation run failed"
                );
                let _ = orchestrator
                    .finalize(&tenant, &investigation_id, InvestigationStatus::Failed, None)
                    .await;
            }
            orchestrator.release(&investigation_id).await;
        });
        true
    }

    async fn release(&self, investigation_id: &str) {
        {
            let mut active = self.inner.active.lock().await;
            if let Some(handle) = active.remove(investigation_id) {
                handle.timeout_guard.cancel();
            }
        }
        self.inner.cancellations.remove(investigation_id).await;
        self.try_admit().await;
    }

    // ------------------------------------------------------------------
    // The run state machine
    // ------------------------------------------------------------------

    async fn drive(
        &self,
        tenant: TenantContext,
        investigation_id: String,
        pause_rx: watch::Receiver<bool>,
        deadline_rx: watch::Receiver<tokio::time::Instant>,
    ) -> OrchestratorResult<()> {
        let inner = &self.inner;
        let investigation = inner
            .store
            .get_investigation(&tenant.tenant_id, &investigation_id)
            .await?;
        let alert = inner
            .store
            .get_alert(&tenant.tenant_id, &investigation.alert_id)
            .await?;
        let run_id = investigation_id.clone();

        let cancel = inner.cancellations.create(&investigation_id).await;
        {
            let active = inner.active.lock().await;
            if let Some(handle) = active.get(&investigation_id) {
                // Mirror the run token so explicit cancel reaches us.
                let run_cancel = cancel.clone();
                let handle_cancel = handle.cancel.clone();
                tokio::spawn(async move {
                    handle_cancel.cancelled().await;
                    run_cancel.cancel();
                });
                let _ = handle
                    .deadline_tx
                    .send(tokio::time::Instant::now()
                        + Duration::from_millis(investigation.timeout_ms));
            }
        }
        self.spawn_timeout_watch(&tenant, &investigation_id, deadline_rx)
            .await;

        let started_at = inner.clock.now();
        inner
            .store
            .mark_investigation_started(&tenant.tenant_id, &investigation_id, started_at)
            .await?;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                tenant_id: Some(&tenant.tenant_id),
                correlation_id: Some(&tenant.correlation_id),
                investigation_id: Some(&investigation_id),
                run_id: Some(&run_id),
                status: Some("start"),
                ..ObservabilityEvent::new("investigation.run.start", "orchestrator")
            },
        );
        self.publish(
            &tenant,
            EventEnvelope::new(methods::RUN_STARTED, &run_id).payload(json!({
                "investigationId": investigation_id,
                "alertId": alert.alert_id,
                "priority": investigation.priority,
                "severity": alert.severity.as_str(),
            })),
        )
        .await;

        let agent_context = AgentContext {
            tenant: tenant.clone(),
            investigation_id: investigation_id.clone(),
            run_id: run_id.clone(),
        };
        let harness_config = HarnessConfig {
            max_attempts: inner.config.max_retry_attempts.max(1),
            timeout: Duration::from_millis(inner.config.step_timeout_ms * 6),
            backoff_base: Duration::from_millis(inner.config.retry_backoff_ms),
        };

        // ---- planning ----
        self.transition(&tenant, &investigation_id, InvestigationStatus::Planning)
            .await?;
        self.wait_if_paused(&investigation_id, &cancel).await;
        let mut feedback_state = FeedbackState::default();
        self.drain_feedback(&tenant, &investigation_id, &mut feedback_state)
            .await;

        self.publish(
            &tenant,
            EventEnvelope::new(methods::turn_started("planner"), &run_id).agent("planner"),
        )
        .await;
        let available_sources = inner.registry.available_types(&tenant.tenant_id).await;
        let planner_input = PlannerInput {
            alert: alert.clone(),
            available_sources: available_sources.clone(),
            step_timeout_ms: inner.config.step_timeout_ms,
            max_retries: inner.config.max_retry_attempts,
        };
        let planner_run = inner
            .harness
            .run(&PlannerAgent, &agent_context, &planner_input, &harness_config)
            .await;
        let plan: Plan = match planner_run.result {
            Some(plan) if !plan.steps.is_empty() => plan,
            _ => {
                self.publish(
                    &tenant,
                    EventEnvelope::new(methods::turn_failed("planner"), &run_id)
                        .agent("planner")
                        .payload(json!({"error": planner_run.error})),
                )
                .await;
                return self
                    .finalize(&tenant, &investigation_id, InvestigationStatus::Failed, None)
                    .await;
            }
        };
        self.publish(
            &tenant,
            EventEnvelope::new(methods::turn_completed("planner"), &run_id)
                .agent("planner")
                .payload(json!({"planId": plan.plan_id, "steps": plan.steps.len()})),
        )
        .await;

        if cancel.is_cancelled() {
            return self.finalize_cancelled(&tenant, &investigation_id).await;
        }

        // ---- executing ----
        self.wait_if_paused(&investigation_id, &cancel).await;
        self.transition(&tenant, &investigation_id, InvestigationStatus::Executing)
            .await?;
        self.publish(
            &tenant,
            EventEnvelope::new(methods::turn_started("executor"), &run_id).agent("executor"),
        )
        .await;
        let outcome = inner
            .engine
            .execute_plan(&tenant, &run_id, &plan, cancel.clone(), pause_rx.clone())
            .await
            .map_err(OrchestratorError::Internal)?;
        inner
            .store
            .set_summary(&tenant.tenant_id, &investigation_id, &outcome.summary)
            .await?;
        self.publish(
            &tenant,
            EventEnvelope::new(methods::turn_completed("executor"), &run_id)
                .agent("executor")
                .payload(json!({
                    "completedSteps": outcome.summary.completed_steps,
                    "failedSteps": outcome.summary.failed_steps,
                    "totalEvidence": outcome.summary.total_evidence,
                })),
        )
        .await;

        if cancel.is_cancelled() {
            return self.finalize_cancelled(&tenant, &investigation_id).await;
        }
        if outcome.escalate {
            return self
                .finalize(
                    &tenant,
                    &investigation_id,
                    InvestigationStatus::RequiresReview,
                    None,
                )
                .await;
        }

        // ---- analyzing ----
        self.transition(&tenant, &investigation_id, InvestigationStatus::Analyzing)
            .await?;
        self.wait_if_paused(&investigation_id, &cancel).await;
        let verdict = match self
            .analyze(
                &tenant,
                &agent_context,
                &alert,
                &outcome,
                &harness_config,
                &mut feedback_state,
            )
            .await?
        {
            Some(verdict) => verdict,
            None => {
                return self
                    .finalize(&tenant, &investigation_id, InvestigationStatus::Failed, None)
                    .await;
            }
        };
        inner
            .store
            .set_verdict(&tenant.tenant_id, &investigation_id, &verdict)
            .await?;

        if cancel.is_cancelled() {
            return self.finalize_cancelled(&tenant, &investigation_id).await;
        }

        // ---- responding ----
        self.transition(&tenant, &investigation_id, InvestigationStatus::Responding)
            .await?;
        self.wait_if_paused(&investigation_id, &cancel).await;
        self.drain_feedback(&tenant, &investigation_id, &mut feedback_state)
            .await;
        // A correction that arrived during responding re-runs the analyst.
        let verdict = if feedback_state.corrections_dirty {
            feedback_state.corrections_dirty = false;
            match self
                .analyze(
                    &tenant,
                    &agent_context,
                    &alert,
                    &outcome,
                    &harness_config,
                    &mut feedback_state,
                )
                .await?
            {
                Some(updated) => {
                    inner
                        .store
                        .set_verdict(&tenant.tenant_id, &investigation_id, &updated)
                        .await?;
                    updated
                }
                None => verdict,
            }
        } else {
            verdict
        };

        self.publish(
            &tenant,
            EventEnvelope::new(methods::turn_started("responder"), &run_id).agent("responder"),
        )
        .await;
        let responder_input = ResponderInput {
            alert: alert.clone(),
            verdict: verdict.clone(),
        };
        let responder_run = inner
            .harness
            .run(
                &ResponderAgent,
                &agent_context,
                &responder_input,
                &harness_config,
            )
            .await;
        let response: ResponsePlan = match responder_run.result {
            Some(response) => response,
            None => {
                self.publish(
                    &tenant,
                    EventEnvelope::new(methods::turn_failed("responder"), &run_id)
                        .agent("responder")
                        .payload(json!({"error": responder_run.error})),
                )
                .await;
                return self
                    .finalize(&tenant, &investigation_id, InvestigationStatus::Failed, None)
                    .await;
            }
        };
        self.publish(
            &tenant,
            EventEnvelope::new(methods::turn_completed("responder"), &run_id)
                .agent("responder")
                .payload(json!({"recommendations": response.recommendations.len()})),
        )
        .await;
        self.publish(
            &tenant,
            EventEnvelope::new(methods::ARTIFACT_CREATED, &run_id)
                .agent("responder")
                .payload(json!({
                    "artifact": "response_recommendations",
                    "recommendations": response.recommendations,
                    "verdict": verdict,
                })),
        )
        .await;

        if feedback_state.escalated {
            return self
                .finalize(
                    &tenant,
                    &investigation_id,
                    InvestigationStatus::RequiresReview,
                    Some(&outcome),
                )
                .await;
        }

        // Containment on critical alerts gates on human approval.
        if response.requires_approval() && alert.severity == Severity::Critical {
            match self
                .await_approval(&tenant, &investigation_id, &run_id, &response)
                .await?
            {
                ApprovalStatus::Approved => {}
                ApprovalStatus::Rejected | ApprovalStatus::Expired => {
                    return self
                        .finalize(
                            &tenant,
                            &investigation_id,
                            InvestigationStatus::RequiresReview,
                            Some(&outcome),
                        )
                        .await;
                }
                ApprovalStatus::Pending => {}
            }
        }

        // An inconclusive verdict keeps the case open for a human.
        let terminal = if verdict.classification == VerdictClass::RequiresReview {
            InvestigationStatus::RequiresReview
        } else {
            InvestigationStatus::Complete
        };
        self.finalize(&tenant, &investigation_id, terminal, Some(&outcome))
            .await
    }

    async fn analyze(
        &self,
        tenant: &TenantContext,
        agent_context: &AgentContext,
        alert: &Alert,
        outcome: &ExecutionOutcome,
        harness_config: &HarnessConfig,
        feedback_state: &mut FeedbackState,
    ) -> OrchestratorResult<Option<Verdict>> {
        let inner = &self.inner;
        let run_id = &agent_context.run_id;
        let investigation_id = &agent_context.investigation_id;

        self.publish(
            tenant,
            EventEnvelope::new(methods::turn_started("analyst"), run_id).agent("analyst"),
        )
        .await;

        let evidence = inner
            .store
            .list_evidence(&tenant.tenant_id, investigation_id)
            .await?;
        let correlations = if outcome.correlations.is_empty() {
            let relationships = inner
                .store
                .list_relationships(&tenant.tenant_id, investigation_id)
                .await?;
            build_correlations(&relationships, &CorrelatorConfig::default())
        } else {
            outcome.correlations.clone()
        };

        // Corrections may land while the analyst runs; loop until quiet.
        for _ in 0..3 {
            self.drain_feedback(tenant, investigation_id, feedback_state)
                .await;
            feedback_state.corrections_dirty = false;
            let analyst_input = AnalystInput {
                alert: alert.clone(),
                evidence: evidence.clone(),
                correlations: correlations.clone(),
                limitations: outcome.limitations.clone(),
                corrections: feedback_state.corrections.clone(),
            };
            let run = inner
                .harness
                .run(&AnalystAgent, agent_context, &analyst_input, harness_config)
                .await;
            let Some(verdict) = run.result else {
                self.publish(
                    tenant,
                    EventEnvelope::new(methods::turn_failed("analyst"), run_id)
                        .agent("analyst")
                        .payload(json!({"error": run.error})),
                )
                .await;
                return Ok(None);
            };

            self.drain_feedback(tenant, investigation_id, feedback_state)
                .await;
            if !feedback_state.corrections_dirty {
                self.publish(
                    tenant,
                    EventEnvelope::new(methods::turn_completed("analyst"), run_id)
                        .agent("analyst")
                        .payload(json!({
                            "classification": verdict.classification.as_str(),
                            "confidence": verdict.confidence,
                        })),
                )
                .await;
                return Ok(Some(verdict));
            }
            // Corrected mid-analysis: run again with the correction applied.
        }

        warn!(investigation_id = %investigation_id, "analyst correction loop limit reached");
        Ok(None)
    }

    async fn await_approval(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        run_id: &str,
        response: &ResponsePlan,
    ) -> OrchestratorResult<ApprovalStatus> {
        self.transition(tenant, investigation_id, InvestigationStatus::AwaitingApproval)
            .await?;

        let now = self.inner.clock.now();
        let title = "Approve containment actions".to_string();
        let description = response
            .recommendations
            .iter()
            .filter(|r| r.requires_approval)
            .map(|r| r.title.clone())
            .collect::<Vec<_>>()
            .join("; ");
        let payload = json!({"recommendations": response.recommendations});
        let ts = now.to_rfc3339();
        let request_id = sentra_wire::synthesize_request_id(&ApprovalSeed {
            run_id,
            agent_id: "responder",
            ts: &ts,
            title: &title,
            description: &description,
            payload: &payload,
        });
        let request = ApprovalRequest {
            request_id: request_id.clone(),
            run_id: run_id.to_string(),
            title: title.clone(),
            description,
            risk: "high".to_string(),
            status: ApprovalStatus::Pending,
            requested_at: now,
            responded_at: None,
            verified: false,
        };

        let (decision_tx, mut decision_rx) = watch::channel(ApprovalStatus::Pending);
        self.inner.approvals.lock().await.insert(
            request_id.clone(),
            PendingApproval {
                request: request.clone(),
                tenant_id: tenant.tenant_id.clone(),
                decision_tx,
            },
        );
        self.publish(
            tenant,
            EventEnvelope::new(methods::APPROVAL_REQUESTED, run_id)
                .agent("responder")
                .payload(json!({
                    "requestId": request_id,
                    "title": title,
                    "risk": "high",
                    "verified": false,
                })),
        )
        .await;

        let timeout = Duration::from_millis(self.inner.config.approval_timeout_ms);
        let status = tokio::select! {
            changed = decision_rx.changed() => {
                if changed.is_ok() {
                    *decision_rx.borrow()
                } else {
                    ApprovalStatus::Expired
                }
            }
            _ = tokio::time::sleep(timeout) => ApprovalStatus::Expired,
        };

        let method = match status {
            ApprovalStatus::Approved => methods::APPROVAL_APPROVED,
            ApprovalStatus::Rejected => methods::APPROVAL_REJECTED,
            _ => methods::APPROVAL_EXPIRED,
        };
        self.publish(
            tenant,
            EventEnvelope::new(method, run_id)
                .agent("responder")
                .payload(json!({"requestId": request_id})),
        )
        .await;
        if let Some(pending) = self.inner.approvals.lock().await.get_mut(&request_id) {
            pending.request.status = status;
            pending.request.responded_at = Some(self.inner.clock.now());
        }

        if status == ApprovalStatus::Approved {
            // Approval resumes execution of the response path.
            self.transition(tenant, investigation_id, InvestigationStatus::Responding)
                .await?;
        }
        Ok(status)
    }

    /// Resolve a pending approval request.
    pub async fn respond_approval(
        &self,
        tenant: &TenantContext,
        request_id: &str,
        approve: bool,
    ) -> OrchestratorResult<()> {
        let approvals = self.inner.approvals.lock().await;
        let Some(pending) = approvals.get(request_id) else {
            return Err(OrchestratorError::NotFound(format!(
                "approval {request_id}"
            )));
        };
        if pending.tenant_id != tenant.tenant_id {
            return Err(OrchestratorError::NotFound(format!(
                "approval {request_id}"
            )));
        }
        if pending.request.status != ApprovalStatus::Pending {
            return Err(OrchestratorError::Conflict(
                "approval already resolved".into(),
            ));
        }
        let _ = pending.decision_tx.send(if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        });
        Ok(())
    }

    pub async fn list_approvals(&self, tenant: &TenantContext) -> Vec<ApprovalRequest> {
        self.inner
            .approvals
            .lock()
            .await
            .values()
            .filter(|p| p.tenant_id == tenant.tenant_id)
            .map(|p| p.request.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Transitions and terminal handling
    // ------------------------------------------------------------------

    async fn transition(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        status: InvestigationStatus,
    ) -> OrchestratorResult<()> {
        self.inner
            .store
            .set_investigation_status(&tenant.tenant_id, investigation_id, status)
            .await?;
        info!(
            investigation_id = %investigation_id,
            status = status.as_str(),
            "investigation transition"
        );
        Ok(())
    }

    async fn finalize(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        status: InvestigationStatus,
        outcome: Option<&ExecutionOutcome>,
    ) -> OrchestratorResult<()> {
        let inner = &self.inner;
        let completed_at = inner.clock.now();
        inner
            .store
            .mark_investigation_completed(&tenant.tenant_id, investigation_id, status, completed_at)
            .await?;

        // run/metrics ahead of the terminal event.
        let connectors = inner.registry.list(&tenant.tenant_id).await;
        let connector_metrics: Vec<Value> = connectors
            .iter()
            .map(|snapshot| {
                json!({
                    "connectorId": snapshot.definition.connector_id,
                    "status": snapshot.status.as_str(),
                    "metrics": snapshot.metrics,
                })
            })
            .collect();
        let agent_metrics = json!({
            "planner": inner.harness.metrics("planner"),
            "analyst": inner.harness.metrics("analyst"),
            "responder": inner.harness.metrics("responder"),
        });
        self.publish(
            tenant,
            EventEnvelope::new(methods::RUN_METRICS, investigation_id).payload(json!({
                "connectors": connector_metrics,
                "agents": agent_metrics,
                "summary": outcome.map(|o| json!({
                    "completedSteps": o.summary.completed_steps,
                    "failedSteps": o.summary.failed_steps,
                    "totalEvidence": o.summary.total_evidence,
                })),
            })),
        )
        .await;
        self.publish(
            tenant,
            EventEnvelope::new(methods::INVESTIGATION_CLEANUP, investigation_id)
                .payload(json!({"status": status.as_str()})),
        )
        .await;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                tenant_id: Some(&tenant.tenant_id),
                investigation_id: Some(investigation_id),
                run_id: Some(investigation_id),
                status: Some(status.as_str()),
                ..ObservabilityEvent::new("investigation.run.finish", "orchestrator")
            },
        );

        let terminal_method = match status {
            InvestigationStatus::Complete | InvestigationStatus::RequiresReview => {
                methods::RUN_COMPLETED
            }
            _ => methods::RUN_FAILED,
        };
        self.publish(
            tenant,
            EventEnvelope::new(terminal_method, investigation_id)
                .payload(json!({"status": status.as_str()})),
        )
        .await;

        let investigation = inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        let verdict = inner
            .store
            .get_verdict(&tenant.tenant_id, investigation_id)
            .await?;
        let summary = inner
            .store
            .get_summary(&tenant.tenant_id, investigation_id)
            .await?;
        let feedback = inner
            .store
            .list_feedback(&tenant.tenant_id, investigation_id)
            .await?;
        inner
            .learning
            .investigation_completed(&InvestigationOutcome {
                investigation,
                verdict,
                summary,
                feedback_count: feedback.len(),
            })
            .await;
        Ok(())
    }

    async fn finalize_cancelled(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<()> {
        // Timeout already stamped timedOut; an explicit cancel lands failed.
        let current = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        let status = if current.status == InvestigationStatus::TimedOut {
            InvestigationStatus::TimedOut
        } else {
            InvestigationStatus::Failed
        };
        self.finalize(tenant, investigation_id, status, None).await
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    async fn spawn_timeout_watch(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        mut deadline_rx: watch::Receiver<tokio::time::Instant>,
    ) {
        let orchestrator = self.clone();
        let tenant = tenant.clone();
        let investigation_id = investigation_id.to_string();
        let guard = {
            let active = self.inner.active.lock().await;
            active
                .get(&investigation_id)
                .map(|h| h.timeout_guard.clone())
                .unwrap_or_default()
        };
        tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow();
                tokio::select! {
                    _ = guard.cancelled() => return,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        // Deadline may have been extended while sleeping.
                        if *deadline_rx.borrow() > tokio::time::Instant::now() {
                            continue;
                        }
                        orchestrator.fire_timeout(&tenant, &investigation_id).await;
                        return;
                    }
                }
            }
        });
    }

    async fn fire_timeout(&self, tenant: &TenantContext, investigation_id: &str) {
        let current = match self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await
        {
            Ok(investigation) => investigation,
            Err(_) => return,
        };
        if current.status.is_terminal() {
            return;
        }
        warn!(investigation_id = %investigation_id, "investigation timed out");
        let _ = self
            .inner
            .store
            .set_investigation_status(
                &tenant.tenant_id,
                investigation_id,
                InvestigationStatus::TimedOut,
            )
            .await;
        self.publish(
            tenant,
            EventEnvelope::new(methods::INVESTIGATION_TIMEOUT, investigation_id)
                .payload(json!({"timeoutMs": current.timeout_ms})),
        )
        .await;
        // Cancellation propagates to in-flight steps; partial evidence stays.
        self.inner.cancellations.cancel(investigation_id).await;
    }

    /// Extend a running investigation's timeout.
    pub async fn extend_timeout(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        delta_ms: u64,
    ) -> OrchestratorResult<()> {
        let investigation = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        if investigation.status.is_terminal() {
            return Err(OrchestratorError::Conflict(
                "investigation is terminal".into(),
            ));
        }
        let active = self.inner.active.lock().await;
        let Some(handle) = active.get(investigation_id) else {
            return Err(OrchestratorError::Conflict(
                "investigation is not running".into(),
            ));
        };
        let current = *handle.deadline_tx.borrow();
        let _ = handle
            .deadline_tx
            .send(current + Duration::from_millis(delta_ms));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pause / resume / cancel
    // ------------------------------------------------------------------

    const PAUSABLE: [InvestigationStatus; 5] = [
        InvestigationStatus::Planning,
        InvestigationStatus::Executing,
        InvestigationStatus::Analyzing,
        InvestigationStatus::Responding,
        InvestigationStatus::AwaitingApproval,
    ];

    pub async fn pause(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<()> {
        let investigation = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        if !Self::PAUSABLE.contains(&investigation.status) {
            return Err(OrchestratorError::Conflict(format!(
                "cannot pause from {}",
                investigation.status
            )));
        }
        let active = self.inner.active.lock().await;
        let Some(handle) = active.get(investigation_id) else {
            return Err(OrchestratorError::Conflict(
                "investigation is not running".into(),
            ));
        };
        *handle
            .resume_status
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = investigation.status;
        let _ = handle.pause_tx.send(true);
        drop(active);

        self.inner
            .store
            .set_investigation_status(
                &tenant.tenant_id,
                investigation_id,
                InvestigationStatus::Paused,
            )
            .await?;
        self.publish(
            tenant,
            EventEnvelope::new(methods::INVESTIGATION_PAUSED, investigation_id).payload(json!({})),
        )
        .await;
        Ok(())
    }

    pub async fn resume(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<()> {
        let investigation = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        let resume_status = {
            let active = self.inner.active.lock().await;
            let Some(handle) = active.get(investigation_id) else {
                return Err(OrchestratorError::Conflict(
                    "investigation is not running".into(),
                ));
            };
            let paused_flag = *handle.pause_tx.borrow();
            if investigation.status != InvestigationStatus::Paused && !paused_flag {
                return Err(OrchestratorError::Conflict(format!(
                    "cannot resume from {}",
                    investigation.status
                )));
            }
            let status = *handle
                .resume_status
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let _ = handle.pause_tx.send(false);
            status
        };
        // Only rewrite the persisted status if the run itself had not moved
        // on past the pause.
        if investigation.status == InvestigationStatus::Paused {
            self.inner
                .store
                .set_investigation_status(&tenant.tenant_id, investigation_id, resume_status)
                .await?;
        }
        self.publish(
            tenant,
            EventEnvelope::new(methods::INVESTIGATION_RESUMED, investigation_id).payload(json!({})),
        )
        .await;
        Ok(())
    }

    /// Wait out a pause at a state-machine boundary.
    async fn wait_if_paused(&self, investigation_id: &str, cancel: &CancellationToken) {
        loop {
            let mut pause_rx = {
                let active = self.inner.active.lock().await;
                match active.get(investigation_id) {
                    Some(handle) => handle.pause_tx.subscribe(),
                    None => return,
                }
            };
            if !*pause_rx.borrow() {
                return;
            }
            tokio::select! {
                _ = pause_rx.changed() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    pub async fn cancel(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<()> {
        let investigation = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        if investigation.status.is_terminal() {
            return Err(OrchestratorError::Conflict(
                "investigation is terminal".into(),
            ));
        }
        let active = self.inner.active.lock().await;
        if let Some(handle) = active.get(investigation_id) {
            handle.cancel.cancel();
        } else {
            // Still queued: drop it from the queue and mark failed.
            drop(active);
            self.inner
                .queue
                .lock()
                .await
                .retain(|entry| entry.investigation_id != investigation_id);
            self.inner
                .store
                .mark_investigation_completed(
                    &tenant.tenant_id,
                    investigation_id,
                    InvestigationStatus::Failed,
                    self.inner.clock.now(),
                )
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    pub async fn post_feedback(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        feedback_type: &str,
        content: Value,
    ) -> OrchestratorResult<String> {
        let parsed: FeedbackType = feedback_type
            .parse()
            .map_err(OrchestratorError::Validation)?;
        // The investigation must exist for this tenant.
        let _ = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;

        let feedback = Feedback {
            feedback_id: mint_id("fb"),
            investigation_id: investigation_id.to_string(),
            tenant_id: tenant.tenant_id.clone(),
            user_id: tenant.user_id.clone(),
            feedback_type: parsed,
            content,
            created_at: self.inner.clock.now(),
        };
        self.inner.store.insert_feedback(&feedback).await?;
        Ok(feedback.feedback_id)
    }

    async fn drain_feedback(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
        state: &mut FeedbackState,
    ) {
        let pending = match self
            .inner
            .store
            .take_pending_feedback(&tenant.tenant_id, investigation_id)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "feedback drain failed");
                return;
            }
        };
        for feedback in pending {
            match feedback.feedback_type {
                FeedbackType::VerdictCorrection => {
                    if let Some(corrected) = feedback
                        .content
                        .get("verdict")
                        .and_then(|v| v.as_str())
                        .and_then(parse_verdict_class)
                    {
                        state.corrections.push(corrected);
                        state.corrections_dirty = true;
                    }
                }
                FeedbackType::Escalation => state.escalated = true,
                FeedbackType::StepFeedback | FeedbackType::Note => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Read surfaces
    // ------------------------------------------------------------------

    pub async fn get_status(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<StatusView> {
        let investigation = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        let steps = self
            .inner
            .store
            .list_steps(&tenant.tenant_id, investigation_id)
            .await?;
        let total = steps.len();
        let completed = steps
            .iter()
            .filter(|s| s.status == sentra_types::StepStatus::Complete)
            .count();
        let progress = if total == 0 {
            0
        } else {
            ((completed * 100) / total) as u8
        };
        let current_agent = match investigation.status {
            InvestigationStatus::Planning => Some("planner"),
            InvestigationStatus::Executing => Some("executor"),
            InvestigationStatus::Analyzing => Some("analyst"),
            InvestigationStatus::Responding | InvestigationStatus::AwaitingApproval => {
                Some("responder")
            }
            _ => None,
        };
        let estimated_completion = investigation
            .started_at
            .map(|s| s + chrono::Duration::milliseconds(investigation.timeout_ms as i64));
        Ok(StatusView {
            status: investigation.status,
            progress,
            current_agent,
            steps,
            started_at: investigation.started_at,
            estimated_completion,
        })
    }

    pub async fn get_timeline(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<Vec<TimelineRow>> {
        let steps = self
            .inner
            .store
            .list_steps(&tenant.tenant_id, investigation_id)
            .await?;
        if steps.is_empty() {
            // Distinguish "no plan yet" from "unknown investigation".
            let _ = self
                .inner
                .store
                .get_investigation(&tenant.tenant_id, investigation_id)
                .await?;
        }
        Ok(steps
            .iter()
            .map(|step| TimelineRow {
                name: step.name.clone(),
                agent: "executor",
                status: step.status.as_str().to_string(),
                started_at: step.started_at,
                completed_at: step.completed_at,
                duration_ms: match (step.started_at, step.completed_at) {
                    (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                    _ => None,
                },
                retries: step.retry_count,
            })
            .collect())
    }

    pub async fn get_report(
        &self,
        tenant: &TenantContext,
        investigation_id: &str,
    ) -> OrchestratorResult<Report> {
        let investigation = self
            .inner
            .store
            .get_investigation(&tenant.tenant_id, investigation_id)
            .await?;
        if !investigation.status.is_terminal() {
            return Err(OrchestratorError::Conflict(
                "report is only available for terminal investigations".into(),
            ));
        }
        let timeline = self.get_timeline(tenant, investigation_id).await?;
        let steps = self
            .inner
            .store
            .list_steps(&tenant.tenant_id, investigation_id)
            .await?;
        let total_retries = steps.iter().map(|s| s.retry_count).sum();
        let completed = steps
            .iter()
            .filter(|s| s.status == sentra_types::StepStatus::Complete)
            .count();
        let failed = steps.len() - completed;
        let verdict = self
            .inner
            .store
            .get_verdict(&tenant.tenant_id, investigation_id)
            .await?;
        let feedback = self
            .inner
            .store
            .list_feedback(&tenant.tenant_id, investigation_id)
            .await?;
        let duration_ms = match (investigation.started_at, investigation.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        Ok(Report {
            duration_ms,
            summary: ReportSummary {
                total_steps: steps.len(),
                completed,
                failed,
                total_retries,
            },
            timeline,
            feedback,
            verdict,
        })
    }

    pub async fn list_investigations(
        &self,
        tenant: &TenantContext,
        filter: &InvestigationFilter,
    ) -> OrchestratorResult<Vec<Investigation>> {
        Ok(self
            .inner
            .store
            .list_investigations(&tenant.tenant_id, filter)
            .await?)
    }

    pub async fn stats(
        &self,
        tenant: &TenantContext,
        timeframe: &str,
    ) -> OrchestratorResult<StatsReport> {
        let hours = match timeframe {
            "24h" => 24,
            "7d" => 24 * 7,
            "30d" => 24 * 30,
            other => {
                return Err(OrchestratorError::Validation(format!(
                    "unknown timeframe {other}; expected 24h, 7d, or 30d"
                )))
            }
        };
        let since = self.inner.clock.now() - chrono::Duration::hours(hours);
        Ok(self
            .inner
            .store
            .stats(&tenant.tenant_id, since, timeframe)
            .await?)
    }

    async fn publish(&self, tenant: &TenantContext, event: EventEnvelope) {
        if let Err(err) = self.inner.bus.publish(&tenant.tenant_id, event).await {
            error!(error = %err, "event publish failed");
        }
    }
}

#[derive(Default)]
struct FeedbackState {
    corrections: Vec<VerdictClass>,
    corrections_dirty: bool,
    escalated: bool,
}

fn parse_verdict_class(raw: &str) -> Option<VerdictClass> {
    match raw {
        "true_positive" => Some(VerdictClass::TruePositive),
        "false_positive" => Some(VerdictClass::FalsePositive),
        "requires_review" => Some(VerdictClass::RequiresReview),
        _ => None,
    }
}

fn default_priority(severity: Severity) -> u8 {
    (severity.rank() + 1).min(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_tracks_severity() {
        assert_eq!(default_priority(Severity::Critical), 5);
        assert_eq!(default_priority(Severity::High), 4);
        assert_eq!(default_priority(Severity::Medium), 3);
        assert_eq!(default_priority(Severity::Low), 2);
    }

    #[test]
    fn verdict_class_parsing_rejects_unknown() {
        assert_eq!(
            parse_verdict_class("false_positive"),
            Some(VerdictClass::FalsePositive)
        );
        assert!(parse_verdict_class("maybe").is_none());
    }
}
