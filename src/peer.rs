//! [`Peer`]: a reachable remote S2S endpoint, tracked by the peer pool.

use std::time::{Duration, Instant};

use url::Url;

/// Default penalty window: how long a peer that just failed is
/// de-prioritized by the selection algorithm (`4.D Peer Pool`).
pub const DEFAULT_PENALTY_WINDOW: Duration = Duration::from_secs(30);

/// Identifies a peer for set/map membership, independent of scheme or path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(String);

impl PeerKey {
    fn from_url(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().unwrap_or(0);
        PeerKey(format!("{host}:{port}"))
    }
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reachable remote endpoint known to the peer pool.
#[derive(Debug, Clone)]
pub struct Peer {
    url: Url,
    /// Rolling load hint from the server's peer list; 0 if unknown.
    pub flow_file_count: u64,
    last_failure: Option<Instant>,
}

impl Peer {
    pub fn new(url: Url) -> Self {
        Peer {
            url,
            flow_file_count: 0,
            last_failure: None,
        }
    }

    pub fn with_flow_file_count(mut self, count: u64) -> Self {
        self.flow_file_count = count;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    /// Derived key used for set/map membership: host+port.
    pub fn key(&self) -> PeerKey {
        PeerKey::from_url(&self.url)
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Record a failure against this peer. The only mutation path for
    /// `last_failure` (`4.D`, "Failure marking").
    pub fn mark_failure(&mut self) {
        self.last_failure = Some(Instant::now());
    }

    /// Whether `now` falls within the penalty window since the last
    /// recorded failure.
    pub fn is_penalized_at(&self, now: Instant, penalty_window: Duration) -> bool {
        match self.last_failure {
            Some(t) => now.saturating_duration_since(t) < penalty_window,
            None => false,
        }
    }
}
