use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::Stream;
use sentra_core::{OrchestratorError, StartRequest};
use sentra_evidence::{parse_query, search_evidence, InvestigationFilter};
use sentra_types::{
    Alert, ConnectorDefinition, EntityMap, InvestigationStatus, Severity, TenantContext,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppState;

// ---------------------------------------------------------------------------
// Tenant context
// ---------------------------------------------------------------------------

fn tenant_from_headers(headers: &HeaderMap) -> TenantContext {
    let header = |name: &str, fallback: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    TenantContext {
        tenant_id: header("x-sentra-tenant", "default"),
        user_id: header("x-sentra-user", "anonymous"),
        correlation_id: headers
            .get("x-sentra-correlation")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<sentra_evidence::StoreError> for ApiError {
    fn from(err: sentra_evidence::StoreError) -> Self {
        ApiError::from(OrchestratorError::from(err))
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alert", post(ingest_alert))
        .route("/investigation", post(start_investigation).get(list_investigations))
        .route("/investigation/{id}", get(investigation_status))
        .route("/investigation/{id}/timeline", get(investigation_timeline))
        .route("/investigation/{id}/report", get(investigation_report))
        .route("/investigation/{id}/feedback", post(post_feedback))
        .route("/investigation/{id}/pause", post(pause_investigation))
        .route("/investigation/{id}/resume", post(resume_investigation))
        .route("/investigation/{id}/cancel", post(cancel_investigation))
        .route("/investigation/{id}/extend", post(extend_timeout))
        .route("/evidence/search", get(evidence_search))
        .route("/evidence/{id}/network", get(evidence_network))
        .route("/connector", post(install_connector).get(list_connectors))
        .route("/approval", get(list_approvals))
        .route("/approval/{id}", post(respond_approval))
        .route("/stats", get(stats))
        .route("/event", get(events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("sentra-server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IngestAlertRequest {
    #[serde(rename = "alertId")]
    alert_id: String,
    title: String,
    severity: Severity,
    source: String,
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "rawPayload", default)]
    raw_payload: Value,
    #[serde(default)]
    entities: EntityMap,
}

async fn ingest_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestAlertRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    if request.alert_id.is_empty() {
        return Err(bad_request("alertId is required"));
    }
    let alert = Alert {
        alert_id: request.alert_id.clone(),
        tenant_id: tenant.tenant_id.clone(),
        title: request.title,
        severity: request.severity,
        source: request.source,
        timestamp: request.timestamp.unwrap_or_else(Utc::now),
        raw_payload: request.raw_payload,
        entities: request.entities,
    };
    state.store.insert_alert(&alert).await?;
    Ok(Json(json!({"alertId": alert.alert_id})))
}

// ---------------------------------------------------------------------------
// Investigations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartInvestigationRequest {
    #[serde(rename = "alertId")]
    alert_id: String,
    priority: Option<u8>,
    #[serde(rename = "timeoutMs")]
    timeout_ms: Option<u64>,
    #[serde(rename = "correlationKey")]
    correlation_key: Option<String>,
}

async fn start_investigation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartInvestigationRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let response = state
        .orchestrator
        .start_investigation(
            &tenant,
            StartRequest {
                alert_id: request.alert_id,
                priority: request.priority,
                timeout_ms: request.timeout_ms,
                correlation_key: request.correlation_key,
            },
        )
        .await?;
    Ok(Json(json!({
        "investigationId": response.investigation_id,
        "status": response.status,
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    severity: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_investigations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let status = query
        .status
        .map(|raw| raw.parse::<InvestigationStatus>().map_err(bad_request))
        .transpose()?;
    let severity = query
        .severity
        .map(|raw| raw.parse::<Severity>().map_err(bad_request))
        .transpose()?;
    let filter = InvestigationFilter {
        status,
        severity,
        from: query.from,
        to: query.to,
        limit: query.limit,
        offset: query.offset.unwrap_or(0),
    };
    let investigations = state.orchestrator.list_investigations(&tenant, &filter).await?;
    Ok(Json(json!({
        "investigations": investigations,
        "limit": filter.effective_limit(),
        "offset": filter.offset,
    })))
}

async fn investigation_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let view = state.orchestrator.get_status(&tenant, &id).await?;
    Ok(Json(json!({
        "status": view.status,
        "progress": view.progress,
        "currentAgent": view.current_agent,
        "steps": view.steps,
        "startedAt": view.started_at,
        "estimatedCompletion": view.estimated_completion,
    })))
}

async fn investigation_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let timeline = state.orchestrator.get_timeline(&tenant, &id).await?;
    Ok(Json(json!({"steps": timeline})))
}

async fn investigation_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let report = state.orchestrator.get_report(&tenant, &id).await?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    #[serde(rename = "type")]
    feedback_type: String,
    #[serde(default)]
    content: Value,
}

async fn post_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let feedback_id = state
        .orchestrator
        .post_feedback(&tenant, &id, &request.feedback_type, request.content)
        .await?;
    Ok(Json(json!({"feedbackId": feedback_id})))
}

async fn pause_investigation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    state.orchestrator.pause(&tenant, &id).await?;
    Ok(Json(json!({"status": "paused"})))
}

async fn resume_investigation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    state.orchestrator.resume(&tenant, &id).await?;
    Ok(Json(json!({"status": "resumed"})))
}

async fn cancel_investigation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    state.orchestrator.cancel(&tenant, &id).await?;
    Ok(Json(json!({"status": "cancelling"})))
}

#[derive(Debug, Deserialize)]
struct ExtendRequest {
    #[serde(rename = "deltaMs")]
    delta_ms: u64,
}

async fn extend_timeout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<ExtendRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    state
        .orchestrator
        .extend_timeout(&tenant, &id, request.delta_ms)
        .await?;
    Ok(Json(json!({"status": "extended"})))
}

// ---------------------------------------------------------------------------
// Evidence search and correlation network
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn evidence_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let query = parse_query(params.q.as_deref().unwrap_or(""));
    let results = search_evidence(
        &state.store,
        &tenant.tenant_id,
        &query,
        params.limit.unwrap_or(50),
        params.offset.unwrap_or(0),
        Utc::now(),
    )
    .await?;
    Ok(Json(serde_json::to_value(results).unwrap_or(Value::Null)))
}

/// `{id}` here is an investigation id; the response is its entity graph.
async fn evidence_network(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    // Existence and tenancy check first.
    let _ = state.store.get_investigation(&tenant.tenant_id, &id).await?;
    let evidence = state.store.list_evidence(&tenant.tenant_id, &id).await?;
    let relationships = state
        .store
        .list_relationships(&tenant.tenant_id, &id)
        .await?;
    let network = sentra_evidence::correlation_network(&evidence, &relationships);
    Ok(Json(serde_json::to_value(network).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InstallConnectorRequest {
    #[serde(flatten)]
    definition: ConnectorDefinition,
}

async fn install_connector(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InstallConnectorRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let mut definition = request.definition;
    // The caller's tenancy always wins over the body.
    definition.tenant_id = tenant.tenant_id.clone();
    state.store.upsert_connector_definition(&definition).await?;
    state
        .registry
        .install(definition.clone())
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(json!({"connectorId": definition.connector_id})))
}

async fn list_connectors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let snapshots = state.registry.list(&tenant.tenant_id).await;
    let connectors: Vec<Value> = snapshots
        .iter()
        .map(|snapshot| {
            json!({
                "connectorId": snapshot.definition.connector_id,
                "type": snapshot.definition.connector_type,
                "priority": snapshot.definition.priority,
                "status": snapshot.status.as_str(),
                "metrics": snapshot.metrics,
                "capabilities": snapshot.capabilities,
                "dataTypes": snapshot.data_types,
            })
        })
        .collect();
    Ok(Json(json!({"connectors": connectors})))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn list_approvals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let approvals = state.orchestrator.list_approvals(&tenant).await;
    Ok(Json(json!({"approvals": approvals})))
}

#[derive(Debug, Deserialize)]
struct ApprovalDecision {
    approve: bool,
}

async fn respond_approval(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    state
        .orchestrator
        .respond_approval(&tenant, &id, decision.approve)
        .await?;
    Ok(Json(json!({"requestId": id, "approved": decision.approve})))
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatsQuery {
    timeframe: Option<String>,
}

async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_from_headers(&headers);
    let timeframe = query.timeframe.as_deref().unwrap_or("24h");
    let report = state.orchestrator.stats(&tenant, timeframe).await?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventStreamQuery {
    #[serde(rename = "runId")]
    run_id: Option<String>,
    #[serde(rename = "fromSequence")]
    from_sequence: Option<i64>,
}

async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let tenant = tenant_from_headers(&headers);
    let stream: futures::stream::BoxStream<'static, Result<Event, std::convert::Infallible>> =
        match query.run_id {
            Some(run_id) => {
                // Subscribing to a run requires owning its investigation.
                let _ = state
                    .store
                    .get_investigation(&tenant.tenant_id, &run_id)
                    .await?;
                let subscription = state
                    .bus
                    .subscribe(&run_id, query.from_sequence.unwrap_or(0))
                    .await
                    .map_err(|err| ApiError {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                        message: err.to_string(),
                    })?;
                Box::pin(futures::stream::unfold(subscription, |mut sub| async {
                    let event = sub.next().await?;
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    Some((Ok(Event::default().data(payload)), sub))
                }))
            }
            None => {
                // Tenant-scoped live firehose.
                let rx = state.bus.subscribe_all();
                let tenant_id = tenant.tenant_id.clone();
                let live = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(
                    move |message| {
                        let event = message.ok()?;
                        let event_tenant = event
                            .params
                            .extra
                            .get("tenantId")
                            .and_then(|v| v.as_str())?;
                        if event_tenant != tenant_id {
                            return None;
                        }
                        let payload = serde_json::to_string(&event).unwrap_or_default();
                        Some(Ok(Event::default().data(payload)))
                    },
                );
                Box::pin(live)
            }
        };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use sentra_agents::AgentHarness;
    use sentra_connectors::builtin::register_builtin_factories;
    use sentra_connectors::{ConnectorRegistry, RegistryConfig};
    use sentra_core::{
        EngineConfig, EngineSettings, EventBus, ExecutionEngine, Orchestrator, SystemClock,
        TenantSettingsCache, TracingLearningSink,
    };
    use sentra_evidence::SqliteStore;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    async fn test_state() -> (AppState, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::new(&tmp.path().join("sentra.db"))
                .await
                .unwrap(),
        );
        let bus = EventBus::new(store.clone(), 200);
        let registry = ConnectorRegistry::new(RegistryConfig::default());
        register_builtin_factories(&registry).await;
        let config = EngineConfig {
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(
            store.clone(),
            registry.clone(),
            bus.clone(),
            EngineSettings::from(&config),
        );
        let orchestrator = Orchestrator::new(
            store,
            bus,
            registry,
            engine,
            AgentHarness::new(),
            config.clone(),
            Arc::new(SystemClock),
            Arc::new(TracingLearningSink),
            TenantSettingsCache::new(tmp.path().join("tenants"), Duration::from_secs(30)),
        );
        (AppState::new(orchestrator, config), tmp)
    }

    fn request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-sentra-tenant", "tenant-a")
            .header("x-sentra-user", "tester")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn alert_ingest_then_start_investigation() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/alert",
                json!({
                    "alertId": "alert-1",
                    "title": "Suspicious PowerShell",
                    "severity": "high",
                    "source": "edr",
                    "rawPayload": {"src_ip": "192.168.1.100"},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/investigation",
                json!({"alertId": "alert-1", "priority": 4}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let investigation_id = body["investigationId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/investigation/{investigation_id}"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert!(status["status"].is_string());
        assert!(status["progress"].is_number());
    }

    #[tokio::test]
    async fn unknown_alert_is_not_found() {
        let (state, _tmp) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(request(
                "POST",
                "/investigation",
                json!({"alertId": "ghost"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cross_tenant_investigation_access_denied() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        app.clone()
            .oneshot(request(
                "POST",
                "/alert",
                json!({
                    "alertId": "alert-1",
                    "title": "t",
                    "severity": "low",
                    "source": "edr",
                    "rawPayload": {},
                }),
            ))
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/investigation",
                json!({"alertId": "alert-1"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let investigation_id = body["investigationId"].as_str().unwrap().to_string();

        let mut foreign = request(
            "GET",
            &format!("/investigation/{investigation_id}"),
            json!({}),
        );
        foreign
            .headers_mut()
            .insert("x-sentra-tenant", "tenant-b".parse().unwrap());
        let response = app.oneshot(foreign).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn feedback_with_unknown_type_is_rejected() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        app.clone()
            .oneshot(request(
                "POST",
                "/alert",
                json!({
                    "alertId": "alert-1",
                    "title": "t",
                    "severity": "low",
                    "source": "edr",
                    "rawPayload": {},
                }),
            ))
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/investigation",
                json!({"alertId": "alert-1"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let investigation_id = body["investigationId"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "POST",
                &format!("/investigation/{investigation_id}/feedback"),
                json!({"type": "mystery", "content": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn connector_listing_reflects_installs() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/connector",
                json!({
                    "connectorId": "siem-primary",
                    "tenantId": "ignored",
                    "type": "siem",
                    "priority": 1,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", "/connector", json!({})))
            .await
            .unwrap();
        let body = body_json(response).await;
        let connectors = body["connectors"].as_array().unwrap();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0]["connectorId"], "siem-primary");
        assert_eq!(connectors[0]["status"], "active");
    }

    #[tokio::test]
    async fn stats_rejects_unknown_timeframe() {
        let (state, _tmp) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(request("GET", "/stats?timeframe=90d", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
