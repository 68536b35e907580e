//! Per-token cache of upstream client sessions.
//!
//! The registry is the only cross-request shared mutable state in the proxy
//! server. It is owned by the composition root and passed into handlers via
//! state (never a global), so tests can construct isolated registries.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;

use crate::client::UpstreamClient;
use crate::fingerprint::DeviceIdProvider;

/// Sentinel key for the empty/default token.
const DEFAULT_TOKEN_KEY: &str = "__default";

/// Lazily-populated token → session map. Entries are never evicted; token
/// cardinality is one user's browser tab set.
pub struct ClientRegistry {
    sessions: RwLock<HashMap<String, Arc<UpstreamClient>>>,
    provider: Arc<dyn DeviceIdProvider>,
    api_base: String,
}

impl ClientRegistry {
    pub fn new(provider: Arc<dyn DeviceIdProvider>, api_base: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            provider,
            api_base: api_base.into(),
        }
    }

    /// Look up the session for `token`, creating it on first use.
    pub async fn client_for(&self, token: &str) -> Result<Arc<UpstreamClient>> {
        let key = if token.is_empty() {
            DEFAULT_TOKEN_KEY
        } else {
            token
        };

        if let Some(client) = self.sessions.read().await.get(key) {
            return Ok(client.clone());
        }

        let mut sessions = self.sessions.write().await;
        // another request may have created it while we waited for the lock
        if let Some(client) = sessions.get(key) {
            return Ok(client.clone());
        }

        tracing::info!(token = %key, "Creating upstream session");
        let client = Arc::new(UpstreamClient::new(
            self.provider.clone(),
            self.api_base.clone(),
            token.to_string(),
        )?);
        sessions.insert(key.to_string(), client.clone());
        Ok(client)
    }

    /// Number of live sessions (test observability).
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct StaticProvider;

    #[async_trait]
    impl DeviceIdProvider for StaticProvider {
        async fn produce_device_id(&self) -> Result<String> {
            Ok("device-static".to_string())
        }
    }

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Arc::new(StaticProvider), "https://example.test")
    }

    #[tokio::test]
    async fn test_same_token_shares_session() {
        let registry = registry();
        let a = registry.client_for("tok-1").await.unwrap();
        let b = registry.client_for("tok-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_tokens_get_distinct_sessions() {
        let registry = registry();
        let a = registry.client_for("tok-1").await.unwrap();
        let b = registry.client_for("tok-2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_empty_token_maps_to_default_session() {
        let registry = registry();
        let a = registry.client_for("").await.unwrap();
        let b = registry.client_for("").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.current_token().await, "");
    }
}
