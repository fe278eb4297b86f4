//! Peer Pool (`4.D`): discovers, caches, scores, and hands out peers across
//! one or more configured remote clusters.
//!
//! Peer mutations (refresh replace, failure mark, selection snapshot) are
//! serialized under a single pool-level [`tokio::sync::Mutex`]; selection
//! releases it before the caller does any network I/O (`5. CONCURRENCY &
//! RESOURCE MODEL`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RemoteClusterConfig;
use crate::error::S2SError;
use crate::peer::{Peer, PeerKey, DEFAULT_PENALTY_WINDOW};
use crate::rest::RestApiClient;

/// Source of randomness for spreading load across equally-loaded peers
/// (`4.D`, "Selection algorithm", step 5). Injectable so tests can supply a
/// deterministic sequence.
pub trait PeerRng: Send + Sync {
    /// Return an index in `0..len`. `len` is always `>= 1`.
    fn choose_index(&self, len: usize) -> usize;
}

/// Default RNG: a fresh `rand::thread_rng()` per call.
#[derive(Debug, Default)]
pub struct ThreadRng;

impl PeerRng for ThreadRng {
    fn choose_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}

/// A seeded, reproducible RNG for deterministic selection tests.
pub struct SeededRng(std::sync::Mutex<StdRng>);

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        SeededRng(std::sync::Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl PeerRng for SeededRng {
    fn choose_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.0.lock().unwrap().gen_range(0..len)
    }
}

/// A peer plus the index of the cluster it was discovered under, so the
/// facade can bind a [`RestApiClient`] with that cluster's auth/proxy/http
/// client.
#[derive(Debug, Clone)]
pub(crate) struct SelectedPeer {
    pub peer: Peer,
    pub cluster_idx: usize,
}

struct ClusterEntry {
    config: RemoteClusterConfig,
    http: Arc<reqwest::Client>,
    peers: Vec<Peer>,
    discovered: bool,
}

/// Owns the working set of peers across all configured clusters.
pub struct PeerPool {
    clusters: Mutex<Vec<ClusterEntry>>,
    penalty_window: Duration,
    rng: Arc<dyn PeerRng>,
}

impl PeerPool {
    pub fn new(remote_clusters: Vec<RemoteClusterConfig>) -> Result<Self, S2SError> {
        let mut clusters = Vec::with_capacity(remote_clusters.len());
        for config in remote_clusters {
            let http = Arc::new(build_http_client(&config)?);
            let peers = config.seed_urls().iter().cloned().map(Peer::new).collect();
            clusters.push(ClusterEntry {
                config,
                http,
                peers,
                discovered: false,
            });
        }
        Ok(PeerPool {
            clusters: Mutex::new(clusters),
            penalty_window: DEFAULT_PENALTY_WINDOW,
            rng: Arc::new(ThreadRng),
        })
    }

    pub fn with_penalty_window(mut self, window: Duration) -> Self {
        self.penalty_window = window;
        self
    }

    pub fn with_rng(mut self, rng: Arc<dyn PeerRng>) -> Self {
        self.rng = rng;
        self
    }

    /// Total known peers across all clusters, after lazily discovering any
    /// cluster that hasn't been discovered yet. Used by the facade to bound
    /// its `min(peersAvailable, 3)` create-transaction retry loop.
    pub(crate) async fn candidate_count(&self) -> Result<usize, S2SError> {
        self.ensure_discovered().await?;
        let clusters = self.clusters.lock().await;
        Ok(clusters.iter().map(|c| c.peers.len()).sum())
    }

    /// Build a [`RestApiClient`] bound to `cluster_idx`'s auth/proxy and
    /// shared `reqwest::Client`, targeting `peer`.
    pub(crate) async fn rest_client_for(&self, cluster_idx: usize, peer: &Peer) -> RestApiClient {
        let clusters = self.clusters.lock().await;
        let cluster = &clusters[cluster_idx];
        RestApiClient::new(cluster.http.as_ref().clone(), peer.url().clone())
            .with_credentials(cluster.config.username.clone(), cluster.config.password.clone())
    }

    /// The username/password configured for `cluster_idx`, for callers that
    /// build their own `RestApiClient` (e.g. with an injected `http`
    /// client) instead of going through [`PeerPool::rest_client_for`].
    pub(crate) async fn cluster_credentials(&self, cluster_idx: usize) -> (Option<String>, Option<String>) {
        let clusters = self.clusters.lock().await;
        let cluster = &clusters[cluster_idx];
        (cluster.config.username.clone(), cluster.config.password.clone())
    }

    /// Resolve `portId` from `portName` against any currently healthy peer.
    pub(crate) async fn get_port_id_for_name(&self, name: &str) -> Result<String, S2SError> {
        let selected = self.select().await?;
        let adapter = self.rest_client_for(selected.cluster_idx, &selected.peer).await;
        let result = adapter.get_port_id_for_name(name).await;
        if let Err(e) = &result {
            if e.is_peer_failure() {
                self.mark_failure(selected.cluster_idx, &selected.peer.key()).await;
            }
        }
        result
    }

    /// Run discovery for any cluster that hasn't been discovered yet
    /// (`4.D` "Discovery": "on first use ... the Pool picks one healthy seed
    /// URL ... and replaces that cluster's known-peer set").
    async fn ensure_discovered(&self) -> Result<(), S2SError> {
        let mut clusters = self.clusters.lock().await;
        for idx in 0..clusters.len() {
            if !clusters[idx].discovered {
                Self::discover_cluster(&mut clusters, idx).await;
            }
        }
        Ok(())
    }

    /// Force rediscovery of every cluster, regardless of whether it has
    /// already been discovered. Called by the client's periodic refresh
    /// loop (`4.D`, "every `peerUpdateInterval`").
    pub(crate) async fn refresh_all(&self) {
        let mut clusters = self.clusters.lock().await;
        for idx in 0..clusters.len() {
            Self::discover_cluster(&mut clusters, idx).await;
        }
    }

    async fn discover_cluster(clusters: &mut [ClusterEntry], idx: usize) {
        let (http, username, password, seeds) = {
            let c = &clusters[idx];
            (
                c.http.clone(),
                c.config.username.clone(),
                c.config.password.clone(),
                c.config.seed_urls().to_vec(),
            )
        };

        for seed in &seeds {
            let adapter = RestApiClient::new(http.as_ref().clone(), seed.clone())
                .with_credentials(username.clone(), password.clone());
            match adapter.get_peers().await {
                Ok(peers) if !peers.is_empty() => {
                    debug!(seed = %seed, peers = peers.len(), "peer discovery succeeded");
                    clusters[idx].peers = peers;
                    clusters[idx].discovered = true;
                    return;
                }
                Ok(_) => {
                    debug!(seed = %seed, "peer discovery returned an empty peer list");
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "peer discovery failed against seed");
                }
            }
        }

        if clusters[idx].discovered {
            warn!("peer discovery failed against every seed; keeping previous snapshot");
        } else {
            warn!("peer discovery failed against every seed; falling back to seed list");
        }
    }

    /// Selection algorithm (`4.D`, "Selection algorithm"): gather
    /// candidates, prefer healthy over penalized, order by ascending load
    /// with oldest-failure/URL tie-breaks, and randomize among the
    /// lowest-load tier.
    pub(crate) async fn select(&self) -> Result<SelectedPeer, S2SError> {
        self.ensure_discovered().await?;
        let clusters = self.clusters.lock().await;
        let now = Instant::now();

        let mut healthy: Vec<(usize, &Peer)> = Vec::new();
        let mut penalized: Vec<(usize, &Peer)> = Vec::new();
        for (idx, cluster) in clusters.iter().enumerate() {
            for peer in &cluster.peers {
                if peer.is_penalized_at(now, self.penalty_window) {
                    penalized.push((idx, peer));
                } else {
                    healthy.push((idx, peer));
                }
            }
        }

        let mut candidates = if !healthy.is_empty() { healthy } else { penalized };
        if candidates.is_empty() {
            return Err(S2SError::NoPeersAvailable);
        }

        candidates.sort_by(|a, b| {
            a.1.flow_file_count
                .cmp(&b.1.flow_file_count)
                .then_with(|| a.1.last_failure().cmp(&b.1.last_failure()))
                .then_with(|| a.1.url().as_str().cmp(b.1.url().as_str()))
        });

        let min_count = candidates[0].1.flow_file_count;
        let lowest_tier_end = candidates.partition_point(|(_, p)| p.flow_file_count == min_count);
        let chosen = self.rng.choose_index(lowest_tier_end);
        let (cluster_idx, peer) = candidates[chosen];

        Ok(SelectedPeer {
            peer: peer.clone(),
            cluster_idx,
        })
    }

    /// Mark `key` in `cluster_idx` as failed. The only mutation path for a
    /// peer's `last_failure` (`4.D`, "Failure marking").
    pub(crate) async fn mark_failure(&self, cluster_idx: usize, key: &PeerKey) {
        let mut clusters = self.clusters.lock().await;
        if let Some(cluster) = clusters.get_mut(cluster_idx) {
            if let Some(peer) = cluster.peers.iter_mut().find(|p| p.key() == *key) {
                info!(peer = %peer.url(), "marking peer failed");
                peer.mark_failure();
            }
        }
    }

    #[cfg(test)]
    fn for_test(peer_groups: Vec<Vec<Peer>>, penalty_window: Duration, rng: Arc<dyn PeerRng>) -> Self {
        let clusters = peer_groups
            .into_iter()
            .map(|peers| ClusterEntry {
                config: RemoteClusterConfig::single(Url::parse("http://placeholder.invalid:1").unwrap())
                    .expect("placeholder cluster config is valid"),
                http: Arc::new(reqwest::Client::new()),
                peers,
                discovered: true,
            })
            .collect();
        PeerPool {
            clusters: Mutex::new(clusters),
            penalty_window,
            rng,
        }
    }
}

fn build_http_client(config: &RemoteClusterConfig) -> Result<reqwest::Client, S2SError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.http_client_tuning.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = config.http_client_tuning.request_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(proxy_cfg) = &config.proxy {
        let mut proxy = reqwest::Proxy::all(proxy_cfg.proxy_url.clone())
            .map_err(|e| S2SError::Config(format!("invalid proxy URL: {e}")))?;
        if let (Some(user), Some(pass)) = (&proxy_cfg.proxy_username, &proxy_cfg.proxy_password) {
            proxy = proxy.basic_auth(user, pass);
        }
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| S2SError::Config(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(url: &str, flow_file_count: u64) -> Peer {
        Peer::new(Url::parse(url).unwrap()).with_flow_file_count(flow_file_count)
    }

    #[tokio::test]
    async fn selection_favors_strictly_the_lowest_load_peer_when_counts_are_distinct() {
        let peers = vec![peer("http://a:8080", 5), peer("http://b:8080", 1), peer("http://c:8080", 9)];
        let pool = PeerPool::for_test(vec![peers], DEFAULT_PENALTY_WINDOW, Arc::new(SeededRng::new(1)));

        for _ in 0..1000 {
            let selected = pool.select().await.unwrap();
            assert_eq!(selected.peer.host(), "b");
        }
    }

    #[tokio::test]
    async fn selection_randomizes_among_the_lowest_load_tier() {
        let peers = vec![peer("http://a:8080", 1), peer("http://b:8080", 1), peer("http://c:8080", 9)];
        let pool = PeerPool::for_test(vec![peers], DEFAULT_PENALTY_WINDOW, Arc::new(SeededRng::new(42)));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let selected = pool.select().await.unwrap();
            seen.insert(selected.peer.host().to_owned());
        }
        assert_eq!(seen, std::collections::HashSet::from(["a".to_owned(), "b".to_owned()]));
    }

    #[tokio::test]
    async fn failed_peer_is_penalized_until_window_elapses() {
        let mut a = peer("http://a:8080", 0);
        a.mark_failure();
        let b = peer("http://b:8080", 0);
        let pool = PeerPool::for_test(
            vec![vec![a, b]],
            Duration::from_secs(30),
            Arc::new(SeededRng::new(7)),
        );

        for _ in 0..20 {
            let selected = pool.select().await.unwrap();
            assert_eq!(selected.peer.host(), "b", "penalized peer must not be selected while healthy peers exist");
        }
    }

    #[tokio::test]
    async fn penalized_peer_is_selected_when_it_is_the_only_candidate() {
        let mut only = peer("http://a:8080", 0);
        only.mark_failure();
        let pool = PeerPool::for_test(vec![vec![only]], Duration::from_secs(30), Arc::new(SeededRng::new(3)));

        let selected = pool.select().await.unwrap();
        assert_eq!(selected.peer.host(), "a");
    }

    #[tokio::test]
    async fn empty_pool_reports_no_peers_available() {
        let pool = PeerPool::for_test(vec![vec![]], DEFAULT_PENALTY_WINDOW, Arc::new(ThreadRng));
        let err = pool.select().await.unwrap_err();
        assert!(matches!(err, S2SError::NoPeersAvailable));
    }

    #[tokio::test]
    async fn mark_failure_is_the_only_mutation_path_for_last_failure() {
        let peers = vec![peer("http://a:8080", 0), peer("http://b:8080", 0)];
        let pool = PeerPool::for_test(vec![peers], Duration::from_secs(30), Arc::new(SeededRng::new(9)));

        let selected = pool.select().await.unwrap();
        pool.mark_failure(selected.cluster_idx, &selected.peer.key()).await;

        for _ in 0..20 {
            let next = pool.select().await.unwrap();
            assert_ne!(next.peer.key(), selected.peer.key());
        }
    }
}
