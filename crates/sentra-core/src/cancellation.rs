use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Tracks one cancellation token per in-flight investigation. Cancellation
/// propagates to every step and connector call derived from the token.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, investigation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .await
            .insert(investigation_id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, investigation_id: &str) -> bool {
        if let Some(token) = self.tokens.lock().await.get(investigation_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn remove(&self, investigation_id: &str) {
        self.tokens.lock().await.remove(investigation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("inv-1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("inv-1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_is_a_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
    }
}
