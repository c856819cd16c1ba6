//! Connection registry: member cluster → live `RemoteClient`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use pkg_constants::controller::KUBECONFIG_SECRET_KEY;
use pkg_constants::state::SECRETS_PREFIX;
use pkg_state::client::StateStore;
use pkg_types::cluster::Cluster;
use pkg_types::kubeconfig::descriptor_from_secret;
use pkg_types::secret::Secret;

use crate::http::HttpRemoteClient;
use crate::remote::{RemoteClient, RemoteError};

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Return a client for `cluster`. Failures are scoped to that cluster.
    async fn client_for(&self, cluster: &Cluster) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}

struct CachedClient {
    /// Encoded descriptor the client was built from.
    descriptor: String,
    client: Arc<dyn RemoteClient>,
}

/// Registry backed by the cluster Secrets in the central store.
///
/// The descriptor of `<ns>/<cluster>` is the Secret `<ns>/<cluster>`.
/// Clients are cached per cluster and rebuilt when the stored descriptor
/// changes.
pub struct SecretConnectionRegistry {
    store: StateStore,
    timeout: Duration,
    cache: DashMap<(String, String), CachedClient>,
}

impl SecretConnectionRegistry {
    pub fn new(store: StateStore, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            cache: DashMap::new(),
        }
    }

    /// Drop the cached client of a cluster.
    pub fn invalidate(&self, namespace: &str, name: &str) {
        self.cache
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl ConnectionRegistry for SecretConnectionRegistry {
    async fn client_for(&self, cluster: &Cluster) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        let key = format!("{}{}/{}", SECRETS_PREFIX, cluster.namespace, cluster.name);
        let secret: Secret = self
            .store
            .get_json(&key)
            .await
            .map_err(|e| RemoteError::Descriptor(e.to_string()))?
            .ok_or_else(|| {
                RemoteError::Descriptor(format!(
                    "secret {}/{} not found",
                    cluster.namespace, cluster.name
                ))
            })?;
        let encoded = secret
            .data
            .get(KUBECONFIG_SECRET_KEY)
            .cloned()
            .unwrap_or_default();

        let cache_key = (cluster.namespace.clone(), cluster.name.clone());
        if let Some(cached) = self.cache.get(&cache_key)
            && cached.descriptor == encoded
        {
            debug!("Reusing cached client for cluster {}", cluster.name);
            return Ok(cached.client.clone());
        }

        let descriptor = descriptor_from_secret(&secret, KUBECONFIG_SECRET_KEY)
            .map_err(|e| RemoteError::Descriptor(e.to_string()))?;
        let client: Arc<dyn RemoteClient> =
            Arc::new(HttpRemoteClient::new(&descriptor, self.timeout)?);
        info!(
            "Built client for cluster {}/{} ({})",
            cluster.namespace, cluster.name, descriptor.server
        );
        self.cache.insert(
            cache_key,
            CachedClient {
                descriptor: encoded,
                client: client.clone(),
            },
        );
        Ok(client)
    }
}
