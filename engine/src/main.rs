use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sentra_agents::AgentHarness;
use sentra_connectors::builtin::{register_builtin_factories, BUILTIN_TYPES};
use sentra_connectors::{BreakerConfig, ConnectorRegistry, RegistryConfig};
use sentra_core::{
    EngineConfig, EngineSettings, EventBus, ExecutionEngine, Orchestrator, StartRequest,
    SystemClock, TenantSettingsCache, TracingLearningSink, DEFAULT_ENGINE_HOST,
    DEFAULT_ENGINE_PORT,
};
use sentra_evidence::SqliteStore;
use sentra_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use sentra_server::{serve, AppState};
use sentra_types::{Alert, AuthSpec, ConnectorDefinition, RateLimits, Severity, TenantContext};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sentra-engine")]
#[command(about = "Headless Sentra investigation backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP engine service.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Ingest an alert from a JSON file and run one investigation to
    /// completion, printing the report.
    Investigate {
        alert_file: PathBuf,
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long)]
        priority: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _guard = init_process_logging(
                ProcessKind::Engine,
                &canonical_logs_dir_from_root(&state_dir),
                14,
            )
            .ok();
            let state = build_state(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
        Command::Investigate {
            alert_file,
            tenant,
            priority,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter("info")
                .with_target(false)
                .init();
            let state_dir = resolve_state_dir(None);
            let state = build_state(&state_dir).await?;
            run_oneshot(&state, &alert_file, &tenant, priority).await?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SENTRA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".sentra")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting sentra-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

async fn build_state(state_dir: &PathBuf) -> anyhow::Result<AppState> {
    tokio::fs::create_dir_all(state_dir).await?;
    let config = EngineConfig::load(Some(&state_dir.join("config.json"))).await?;

    let store = Arc::new(SqliteStore::new(&state_dir.join("sentra.db")).await?);
    let bus = EventBus::new(store.clone(), config.event_buffer_size);

    let registry = ConnectorRegistry::new(RegistryConfig {
        breaker: BreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            recovery_timeout: Duration::from_millis(config.circuit_recovery_ms),
        },
        ..RegistryConfig::default()
    });
    register_builtin_factories(&registry).await;
    install_connectors(&registry, &store).await?;
    let _health_monitor = registry.spawn_health_monitor();

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
        TenantSettingsCache::new(state_dir.join("tenants"), Duration::from_secs(30)),
    );

    Ok(AppState::new(orchestrator, config))
}

/// Bring up persisted connector definitions; seed the builtin simulators for
/// the default tenant when none exist yet.
async fn install_connectors(
    registry: &ConnectorRegistry,
    store: &Arc<SqliteStore>,
) -> anyhow::Result<()> {
    let mut definitions = store.list_connector_definitions("default").await?;
    if definitions.is_empty() {
        for connector_type in BUILTIN_TYPES {
            let definition = ConnectorDefinition {
                connector_id: format!("{connector_type}-primary"),
                tenant_id: "default".to_string(),
                connector_type: connector_type.to_string(),
                priority: 1,
                auth: AuthSpec::default(),
                rate_limits: RateLimits::default(),
                settings: serde_json::json!({}),
            };
            store.upsert_connector_definition(&definition).await?;
            definitions.push(definition);
        }
    }
    for definition in definitions {
        if let Err(err) = registry.install(definition.clone()).await {
            tracing::warn!(
                connector_id = %definition.connector_id,
                error = %err,
                "connector install failed"
            );
        }
    }
    Ok(())
}

async fn run_oneshot(
    state: &AppState,
    alert_file: &PathBuf,
    tenant_id: &str,
    priority: Option<u8>,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(alert_file)
        .await
        .with_context(|| format!("failed to read {}", alert_file.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;

    let tenant = TenantContext::new(tenant_id, "cli", uuid::Uuid::new_v4().to_string());
    let alert = Alert {
        alert_id: parsed
            .get("alertId")
            .and_then(|v| v.as_str())
            .unwrap_or("cli-alert")
            .to_string(),
        tenant_id: tenant.tenant_id.clone(),
        title: parsed
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("CLI alert")
            .to_string(),
        severity: parsed
            .get("severity")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Severity>().ok())
            .unwrap_or(Severity::Medium),
        source: parsed
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("cli")
            .to_string(),
        timestamp: chrono::Utc::now(),
        raw_payload: parsed
            .get("rawPayload")
            .cloned()
            .unwrap_or(parsed.clone()),
        entities: Default::default(),
    };
    state.store.insert_alert(&alert).await?;

    let started = state
        .orchestrator
        .start_investigation(
            &tenant,
            StartRequest {
                alert_id: alert.alert_id.clone(),
                priority,
                timeout_ms: None,
                correlation_key: None,
            },
        )
        .await
        .map_err(|err| anyhow::anyhow!(err))?;
    info!(investigation_id = %started.investigation_id, "investigation started");

    // Wait for the terminal state, then print the report.
    loop {
        let investigation = state
            .store
            .get_investigation(&tenant.tenant_id, &started.investigation_id)
            .await?;
        if investigation.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let report = state
        .orchestrator
        .get_report(&tenant, &started.investigation_id)
        .await
        .map_err(|err| anyhow::anyhow!(err))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
