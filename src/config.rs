//! Client configuration types (`3. DATA MODEL`).
//!
//! These are plain structs validated at construction time rather than via a
//! separate builder abstraction — bad input fails fast with a typed
//! [`S2SError::Config`], per the REDESIGN FLAGS in spec.md `9`.

use std::collections::HashSet;
use std::time::Duration;

use url::Url;

use crate::error::S2SError;

/// Transport protocol for a remote cluster. Only HTTP is implemented; the
/// raw-socket S2S variant is an explicit Non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Http,
}

impl Default for TransportProtocol {
    fn default() -> Self {
        TransportProtocol::Http
    }
}

/// Optional HTTP proxy in front of a remote cluster, with optional Basic
/// Auth credentials.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub proxy_url: Url,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
}

impl ProxyConfig {
    pub fn new(proxy_url: Url) -> Self {
        ProxyConfig {
            proxy_url,
            proxy_username: None,
            proxy_password: None,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }
}

/// Tuning knobs passed through to the underlying `reqwest::Client`.
///
/// Treated as an external concern per `1. PURPOSE & SCOPE` (connection
/// reuse/TLS/proxy credentials belong to the HTTP transport), but the
/// timeouts are configured here since they gate every REST call this crate
/// makes.
#[derive(Debug, Clone, Default)]
pub struct HttpClientTuning {
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

/// Configuration for one remote NiFi-style cluster: a set of seed URLs that
/// the peer pool uses to bootstrap discovery, plus auth/proxy/transport
/// settings shared by every peer discovered from those seeds.
#[derive(Debug, Clone)]
pub struct RemoteClusterConfig {
    seed_urls: Vec<Url>,
    pub transport_protocol: TransportProtocol,
    pub proxy: Option<ProxyConfig>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub http_client_tuning: HttpClientTuning,
}

impl RemoteClusterConfig {
    /// Build a config from a non-empty, duplicate-free set of seed URLs.
    ///
    /// Each URL must carry an absolute scheme and host. Duplicates are
    /// compared by (scheme, host, port).
    pub fn new(seed_urls: Vec<Url>) -> Result<Self, S2SError> {
        if seed_urls.is_empty() {
            return Err(S2SError::Config(
                "RemoteClusterConfig requires at least one seed URL".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for url in &seed_urls {
            validate_absolute_url(url)?;
            let key = (url.scheme().to_owned(), url.host_str().map(str::to_owned), url.port_or_known_default());
            if !seen.insert(key) {
                return Err(S2SError::Config(format!(
                    "duplicate seed URL by host+port+scheme: {}",
                    url
                )));
            }
        }

        Ok(RemoteClusterConfig {
            seed_urls,
            transport_protocol: TransportProtocol::Http,
            proxy: None,
            username: None,
            password: None,
            http_client_tuning: HttpClientTuning::default(),
        })
    }

    /// Convenience constructor for a single-seed cluster.
    pub fn single(seed_url: Url) -> Result<Self, S2SError> {
        Self::new(vec![seed_url])
    }

    pub fn seed_urls(&self) -> &[Url] {
        &self.seed_urls
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_http_client_tuning(mut self, tuning: HttpClientTuning) -> Self {
        self.http_client_tuning = tuning;
        self
    }
}

fn validate_absolute_url(url: &Url) -> Result<(), S2SError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(S2SError::Config(format!(
            "seed URL must use http or https scheme: {}",
            url
        )));
    }
    if url.host_str().is_none() {
        return Err(S2SError::Config(format!("seed URL missing host: {}", url)));
    }
    Ok(())
}

/// Identifies the remote input port a client sends packets to — exactly one
/// of `portId`/`portName` in the data model.
#[derive(Debug, Clone)]
pub enum PortRef {
    Id(String),
    Name(String),
}

/// Top-level, immutable client configuration.
///
/// Construction validates that there is at least one remote cluster, and
/// (implicitly, via [`PortRef`]) that exactly one of `portId`/`portName` is
/// set — the type itself rules out the "both or neither" case the Objective-C
/// original allowed.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub remote_clusters: Vec<RemoteClusterConfig>,
    pub port: PortRef,
    /// Interval between peer-list refreshes. `Duration::ZERO` disables
    /// periodic refresh (the default); the first discovery per cluster still
    /// happens lazily on first use regardless of this setting.
    pub peer_update_interval: Duration,
}

impl ClientConfig {
    pub fn new(remote_clusters: Vec<RemoteClusterConfig>, port: PortRef) -> Result<Self, S2SError> {
        if remote_clusters.is_empty() {
            return Err(S2SError::Config(
                "ClientConfig requires at least one remote cluster".to_owned(),
            ));
        }
        if let PortRef::Name(name) = &port {
            if name.trim().is_empty() {
                return Err(S2SError::Config("portName must not be empty".to_owned()));
            }
        }
        if let PortRef::Id(id) = &port {
            if id.trim().is_empty() {
                return Err(S2SError::Config("portId must not be empty".to_owned()));
            }
        }

        Ok(ClientConfig {
            remote_clusters,
            port,
            peer_update_interval: Duration::ZERO,
        })
    }

    pub fn with_peer_update_interval(mut self, interval: Duration) -> Self {
        self.peer_update_interval = interval;
        self
    }
}
