//! Client Facade (`4.E`): resolves config → pool → mints [`Transaction`]s.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ClientConfig, PortRef};
use crate::error::S2SError;
use crate::pool::PeerPool;
use crate::rest::RestApiClient;
use crate::transaction::Transaction;

/// Entry point: holds the frozen [`ClientConfig`], lazily constructs the
/// peer pool, and mints [`Transaction`]s against the configured port.
///
/// Safe for concurrent use by multiple producer threads (`5. CONCURRENCY &
/// RESOURCE MODEL`); a single [`Transaction`] is not.
pub struct Client {
    config: ClientConfig,
    pool: Arc<PeerPool>,
    port_id: OnceCell<String>,
    refresh_handle: Option<JoinHandle<()>>,
}

impl Client {
    /// Build a client from a validated [`ClientConfig`]. Spawns the
    /// background peer-refresh loop if `peer_update_interval > 0`
    /// (`4.D`, "Discovery").
    pub fn new(config: ClientConfig) -> Result<Self, S2SError> {
        let pool = Arc::new(PeerPool::new(config.remote_clusters.clone())?);

        let refresh_handle = if !config.peer_update_interval.is_zero() {
            let interval = config.peer_update_interval;
            let pool = pool.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick is immediate; first discovery happens lazily on first use
                loop {
                    ticker.tick().await;
                    pool.refresh_all().await;
                }
            }))
        } else {
            None
        };

        Ok(Client {
            config,
            pool,
            port_id: OnceCell::new(),
            refresh_handle,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve `portId`, select a peer, and open a new server-side
    /// transaction (`4.E`, steps 1–5).
    ///
    /// On a peer-scoped failure (503 or transport error) from
    /// `createTransaction`, marks that peer failed and retries with the
    /// next one, up to `min(peersAvailable, 3)` attempts total.
    pub async fn create_transaction(&self) -> Result<Transaction, S2SError> {
        let port_id = self.resolve_port_id().await?;

        let peers_available = self.pool.candidate_count().await?.max(1);
        let max_attempts = peers_available.min(3);

        let mut last_err = S2SError::NoPeersAvailable;
        for attempt in 1..=max_attempts {
            let selected = self.pool.select().await?;
            let adapter = self.pool.rest_client_for(selected.cluster_idx, &selected.peer).await;

            match adapter.create_transaction(&port_id).await {
                Ok(resource) => {
                    let pool = self.pool.clone();
                    let cluster_idx = selected.cluster_idx;
                    let key = selected.peer.key();
                    let on_failure: Arc<dyn Fn() + Send + Sync> =
                        Arc::new(move || {
                            let pool = pool.clone();
                            let key = key.clone();
                            tokio::spawn(async move { pool.mark_failure(cluster_idx, &key).await });
                        });

                    return Ok(Transaction::new(
                        adapter,
                        resource,
                        port_id,
                        selected.peer,
                        true,
                        Some(on_failure),
                    ));
                }
                Err(e) if e.is_peer_failure() => {
                    warn!(
                        attempt,
                        max_attempts,
                        peer = %selected.peer.url(),
                        error = %e,
                        "createTransaction failed against peer, marking failed and retrying"
                    );
                    self.pool.mark_failure(selected.cluster_idx, &selected.peer.key()).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    /// As [`Client::create_transaction`], but sends requests through a
    /// caller-supplied `reqwest::Client` rather than the pool's
    /// per-cluster one (`6. EXTERNAL INTERFACES`, "Public API operations").
    pub async fn create_transaction_with_http_client(&self, http: reqwest::Client) -> Result<Transaction, S2SError> {
        let port_id = self.resolve_port_id().await?;
        let peers_available = self.pool.candidate_count().await?.max(1);
        let max_attempts = peers_available.min(3);

        let mut last_err = S2SError::NoPeersAvailable;
        for attempt in 1..=max_attempts {
            let selected = self.pool.select().await?;
            let (username, password) = self.pool.cluster_credentials(selected.cluster_idx).await;
            let adapter =
                RestApiClient::new(http.clone(), selected.peer.url().clone()).with_credentials(username, password);

            match adapter.create_transaction(&port_id).await {
                Ok(resource) => {
                    let pool = self.pool.clone();
                    let cluster_idx = selected.cluster_idx;
                    let key = selected.peer.key();
                    let on_failure: Arc<dyn Fn() + Send + Sync> =
                        Arc::new(move || {
                            let pool = pool.clone();
                            let key = key.clone();
                            tokio::spawn(async move { pool.mark_failure(cluster_idx, &key).await });
                        });

                    return Ok(Transaction::new(
                        adapter,
                        resource,
                        port_id,
                        selected.peer,
                        true,
                        Some(on_failure),
                    ));
                }
                Err(e) if e.is_peer_failure() => {
                    warn!(attempt, max_attempts, peer = %selected.peer.url(), error = %e, "createTransaction failed");
                    self.pool.mark_failure(selected.cluster_idx, &selected.peer.key()).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    /// Resolve and cache `portId` for the client's lifetime (`4.E`, step 1).
    async fn resolve_port_id(&self) -> Result<String, S2SError> {
        match &self.config.port {
            PortRef::Id(id) => Ok(id.clone()),
            PortRef::Name(name) => {
                self.port_id
                    .get_or_try_init(|| async {
                        let id = self.pool.get_port_id_for_name(name).await?;
                        info!(port_name = %name, port_id = %id, "resolved portId from portName");
                        Ok::<_, S2SError>(id)
                    })
                    .await
                    .cloned()
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }
    }
}
