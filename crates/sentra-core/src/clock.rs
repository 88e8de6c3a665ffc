// Clock and identity: time source injection, id minting, idempotency keys.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

/// Injected time source. Production uses [`SystemClock`]; tests pin time
/// with [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced explicitly.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(now)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mint a prefixed opaque id, e.g. `inv_8f14e45f…`.
pub fn mint_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Deterministic idempotency key over `(tenant, alert, correlation key)`.
pub fn idempotency_key(tenant_id: &str, alert_id: &str, correlation_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(alert_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(correlation_key.as_bytes());
    let digest = hasher.finalize();
    hex_lower(&digest[..16])
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_and_scoped() {
        let a = idempotency_key("tenant-a", "alert-1", "corr");
        let b = idempotency_key("tenant-a", "alert-1", "corr");
        assert_eq!(a, b);
        assert_ne!(a, idempotency_key("tenant-b", "alert-1", "corr"));
        assert_ne!(a, idempotency_key("tenant-a", "alert-2", "corr"));
        assert_ne!(a, idempotency_key("tenant-a", "alert-1", "other"));
    }

    #[test]
    fn separator_prevents_field_collisions() {
        assert_ne!(
            idempotency_key("tenant", "ab", "c"),
            idempotency_key("tenant", "a", "bc")
        );
    }

    #[test]
    fn minted_ids_carry_prefix_and_are_unique() {
        let a = mint_id("inv");
        let b = mint_id("inv");
        assert!(a.starts_with("inv_"));
        assert_ne!(a, b);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at(Utc::now());
        let before = clock.now();
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now() - before, Duration::seconds(30));
    }
}
