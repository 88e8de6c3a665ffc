// Engine configuration: JSON file layer overridden by environment, plus a
// TTL-cached per-tenant settings view. Nothing is globally mutable after
// startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_investigations: usize,
    #[serde(default = "default_investigation_timeout_ms")]
    pub default_investigation_timeout_ms: u64,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_ms")]
    pub circuit_recovery_ms: u64,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    /// Backoff base for step retries. Exposed so tests can compress time.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Queue depth beyond which low-priority admissions are deferred.
    #[serde(default = "default_queue_soft_limit")]
    pub queue_soft_limit: usize,
    /// How long a pending approval may wait before it expires.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    10
}
fn default_investigation_timeout_ms() -> u64 {
    1_800_000
}
fn default_max_parallel_steps() -> usize {
    3
}
fn default_step_timeout_ms() -> u64 {
    5_000
}
fn default_max_retry_attempts() -> u32 {
    2
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_recovery_ms() -> u64 {
    30_000
}
fn default_event_buffer_size() -> usize {
    200
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_queue_soft_limit() -> usize {
    20
}
fn default_approval_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_investigations: default_max_concurrent(),
            default_investigation_timeout_ms: default_investigation_timeout_ms(),
            max_parallel_steps: default_max_parallel_steps(),
            step_timeout_ms: default_step_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_ms: default_circuit_recovery_ms(),
            event_buffer_size: default_event_buffer_size(),
            retry_backoff_ms: default_retry_backoff_ms(),
            queue_soft_limit: default_queue_soft_limit(),
            approval_timeout_ms: default_approval_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load the file layer (if present) and apply environment overrides.
    pub async fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match config_path {
            Some(path) => match fs::read_to_string(path).await {
                Ok(raw) => serde_json::from_str(&raw)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
                Err(err) => return Err(err.into()),
            },
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        read_env(
            "MAX_CONCURRENT_INVESTIGATIONS",
            &mut self.max_concurrent_investigations,
        );
        read_env(
            "DEFAULT_INVESTIGATION_TIMEOUT_MS",
            &mut self.default_investigation_timeout_ms,
        );
        read_env("MAX_PARALLEL_STEPS", &mut self.max_parallel_steps);
        read_env("STEP_TIMEOUT_MS", &mut self.step_timeout_ms);
        read_env("MAX_RETRY_ATTEMPTS", &mut self.max_retry_attempts);
        read_env(
            "CIRCUIT_FAILURE_THRESHOLD",
            &mut self.circuit_failure_threshold,
        );
        read_env("CIRCUIT_RECOVERY_MS", &mut self.circuit_recovery_ms);
        read_env("EVENT_BUFFER_SIZE", &mut self.event_buffer_size);
        read_env("RETRY_BACKOFF_MS", &mut self.retry_backoff_ms);
        read_env("QUEUE_SOFT_LIMIT", &mut self.queue_soft_limit);
        read_env("APPROVAL_TIMEOUT_MS", &mut self.approval_timeout_ms);
    }
}

/// Read `SENTRA_<KEY>` with a fallback to the bare key.
fn read_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    let raw = std::env::var(format!("SENTRA_{key}")).or_else(|_| std::env::var(key));
    if let Ok(raw) = raw {
        if let Ok(parsed) = raw.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}

/// Per-tenant overrides, read through a TTL cache.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TenantSettings {
    /// Override for the queue soft limit.
    pub queue_soft_limit: Option<usize>,
    /// Override for the default investigation timeout.
    pub default_investigation_timeout_ms: Option<u64>,
}

struct CachedSettings {
    settings: TenantSettings,
    loaded_at: Instant,
}

/// Read-through TTL cache over per-tenant settings files stored under
/// `<dir>/<tenant>.json`. Missing files resolve to defaults.
#[derive(Clone)]
pub struct TenantSettingsCache {
    dir: PathBuf,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<String, CachedSettings>>>,
}

impl TenantSettingsCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, tenant_id: &str) -> TenantSettings {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(tenant_id) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return entry.settings.clone();
                }
            }
        }

        let settings = self.load(tenant_id).await;
        self.cache.write().await.insert(
            tenant_id.to_string(),
            CachedSettings {
                settings: settings.clone(),
                loaded_at: Instant::now(),
            },
        );
        settings
    }

    async fn load(&self, tenant_id: &str) -> TenantSettings {
        // Tenant ids are opaque; only simple names map to files.
        if tenant_id.contains(['/', '\\', '.']) {
            return TenantSettings::default();
        }
        let path = self.dir.join(format!("{tenant_id}.json"));
        match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => TenantSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_investigations, 10);
        assert_eq!(config.default_investigation_timeout_ms, 1_800_000);
        assert_eq!(config.max_parallel_steps, 3);
        assert_eq!(config.step_timeout_ms, 5_000);
        assert_eq!(config.max_retry_attempts, 2);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_recovery_ms, 30_000);
        assert_eq!(config.event_buffer_size, 200);
    }

    #[test]
    fn partial_file_layer_keeps_other_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_parallel_steps": 7}"#).unwrap();
        assert_eq!(config.max_parallel_steps, 7);
        assert_eq!(config.max_concurrent_investigations, 10);
    }

    #[tokio::test]
    async fn tenant_settings_fall_back_to_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = TenantSettingsCache::new(temp.path(), Duration::from_secs(30));
        let settings = cache.get("tenant-a").await;
        assert!(settings.queue_soft_limit.is_none());
    }

    #[tokio::test]
    async fn tenant_settings_are_cached_within_ttl() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("tenant-a.json");
        std::fs::write(&path, r#"{"queue_soft_limit": 5}"#).unwrap();

        let cache = TenantSettingsCache::new(temp.path(), Duration::from_secs(300));
        assert_eq!(cache.get("tenant-a").await.queue_soft_limit, Some(5));

        // A file change inside the TTL window is not observed.
        std::fs::write(&path, r#"{"queue_soft_limit": 9}"#).unwrap();
        assert_eq!(cache.get("tenant-a").await.queue_soft_limit, Some(5));
    }
}
