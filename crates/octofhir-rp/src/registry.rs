//! Cache of per-issuer clients.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::RpResult;
use crate::client::{Client, ClientEnvironment};
use crate::config::ClientConfig;

/// Issuer to [`Client`] cache.
///
/// The first lookup of an issuer constructs its client exactly once, even
/// when several tasks race for it. Entries live as long as the registry.
pub struct ClientRegistry {
    clients: DashMap<String, Arc<OnceCell<Arc<Client>>>>,
    env: ClientEnvironment,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(env: ClientEnvironment) -> Self {
        Self {
            clients: DashMap::new(),
            env,
        }
    }

    /// Settings shared by every client.
    #[must_use]
    pub fn environment(&self) -> &ClientEnvironment {
        &self.env
    }

    /// Returns the client of `issuer`, constructing it from `config` on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns the configuration error of a failed construction. Nothing is
    /// cached in that case, so a later call tries again.
    pub async fn client_for(&self, issuer: &str, config: &ClientConfig) -> RpResult<Arc<Client>> {
        self.get_or_init(issuer, || Client::from_config(issuer, config, &self.env))
            .await
    }

    /// Returns the cached client of `issuer` or runs `init` to create it.
    ///
    /// Concurrent callers for the same issuer wait for the first one.
    ///
    /// # Errors
    ///
    /// Returns the error of `init`. The failed entry is dropped so that
    /// unknown issuers do not accumulate.
    pub async fn get_or_init<F>(&self, issuer: &str, init: F) -> RpResult<Arc<Client>>
    where
        F: FnOnce() -> RpResult<Client>,
    {
        let key = cache_key(issuer);
        let cell = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async move { init().map(Arc::new) })
            .await
            .cloned();
        if result.is_err() {
            self.clients.remove_if(&key, |_, cell| !cell.initialized());
        }
        result
    }

    /// Returns the client of `issuer` if it was constructed.
    #[must_use]
    pub fn get(&self, issuer: &str) -> Option<Arc<Client>> {
        self.clients
            .get(&cache_key(issuer))
            .and_then(|cell| cell.get().cloned())
    }

    /// Returns the issuers with a constructed client.
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        let mut issuers: Vec<String> = self
            .clients
            .iter()
            .filter_map(|entry| entry.value().get().map(|c| c.issuer().to_string()))
            .collect();
        issuers.sort();
        issuers
    }

    /// Drops the client of `issuer`. Returns `true` if one was cached.
    pub fn remove(&self, issuer: &str) -> bool {
        self.clients.remove(&cache_key(issuer)).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.iter().filter(|e| e.value().initialized()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cache_key(issuer: &str) -> String {
    issuer.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::ServiceSpec;
    use crate::error::RpError;
    use crate::keys::InMemoryKeyStore;
    use crate::service::ServiceRegistry;
    use crate::transport::ReqwestTransport;

    fn registry() -> Arc<ClientRegistry> {
        let env = ClientEnvironment {
            base_url: "https://rp.example.com".to_string(),
            hash_seed: String::new(),
            request_timeout: Duration::from_secs(1),
            clock_skew_tolerance: Duration::from_secs(60),
            keys: Arc::new(InMemoryKeyStore::new()),
            transport: Arc::new(ReqwestTransport::new(Duration::from_secs(1), false).unwrap()),
            services: ServiceRegistry::with_builtin(),
        };
        Arc::new(ClientRegistry::new(env))
    }

    #[tokio::test]
    async fn test_client_for_is_cached() {
        let registry = registry();
        let config = ClientConfig::new().with_service("authorization", ServiceSpec::standard());

        let a = registry.client_for("https://op.example.com", &config).await.unwrap();
        let b = registry.client_for("https://op.example.com/", &config).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.issuers(), vec!["https://op.example.com".to_string()]);
        assert!(registry.get("https://op.example.com").is_some());
        assert!(registry.get("https://other.example.com").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_constructs_once() {
        let registry = registry();
        let constructed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let constructed = constructed.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_init("https://op.example.com", || {
                        constructed.fetch_add(1, Ordering::SeqCst);
                        Client::from_config(
                            "https://op.example.com",
                            &ClientConfig::new(),
                            registry.environment(),
                        )
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap());
        }
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    }

    #[tokio::test]
    async fn test_failed_construction_is_not_cached() {
        let registry = registry();
        let bad = ClientConfig::new().with_service("teleport", ServiceSpec::standard());
        assert!(matches!(
            registry.client_for("https://op.example.com", &bad).await,
            Err(RpError::Configuration { .. })
        ));
        assert!(registry.is_empty());
        assert_eq!(registry.clients.len(), 0);

        for i in 0..100 {
            let issuer = format!("https://op{}.example.com", i);
            assert!(registry.client_for(&issuer, &bad).await.is_err());
        }
        assert_eq!(registry.clients.len(), 0);

        let good = ClientConfig::new();
        assert!(registry.client_for("https://op.example.com", &good).await.is_ok());
        assert!(registry.remove("https://op.example.com"));
        assert!(registry.is_empty());
    }
}
