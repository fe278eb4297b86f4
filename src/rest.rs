//! REST Adapter (`4.B`): single-shot HTTP calls against one peer's base URL.
//!
//! No retries happen at this layer — that's the pool's concern (`4.E`,
//! `7. ERROR HANDLING DESIGN`). Each operation maps 2xx to a typed success
//! value and anything else to [`S2SError`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::encoder::BodyStream;
use crate::error::S2SError;
use crate::peer::Peer;

/// Server-issued handle returned by `createTransaction`. Read-only once
/// parsed.
#[derive(Debug, Clone)]
pub struct TransactionResource {
    pub transaction_url: Url,
    pub content_url: Url,
    pub server_ttl: Duration,
}

/// The `responseCode` query parameter values accepted by `commitTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Confirm,
    BadChecksum,
    Cancel,
}

impl CommitAction {
    fn code(self) -> u16 {
        match self {
            CommitAction::Confirm => 12,
            CommitAction::BadChecksum => 19,
            CommitAction::Cancel => 15,
        }
    }
}

/// Fields parsed from a successful `commitTransaction` response.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub packets_transferred: u64,
    pub duration: Duration,
    pub message: Option<String>,
    pub should_backoff: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeersResponseDto {
    peers: Vec<PeerDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerDto {
    hostname: String,
    port: u16,
    secure: bool,
    #[serde(default)]
    flow_file_count: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SiteToSiteDto {
    #[serde(default)]
    input_ports: Vec<PortDto>,
    #[serde(default)]
    controller: Option<ControllerDto>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ControllerDto {
    #[serde(default)]
    input_ports: Vec<PortDto>,
}

#[derive(Debug, Deserialize, Clone)]
struct PortDto {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponseDto {
    flow_file_sent: u64,
    #[serde(default)]
    duration_millis: Option<u64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    should_backoff: bool,
}

/// Single-shot REST calls against one peer, bound to one cluster's
/// auth/proxy configuration.
///
/// Cheaply [`Clone`]: the underlying `reqwest::Client` is itself
/// `Arc`-backed, and the bearer token is shared through an
/// [`Arc<RwLock<_>>`] so every clone sees a token refresh performed by any
/// other. This lets the Transaction hand one clone to its send-data task and
/// another to its TTL keep-alive ticker without serializing the long-lived
/// streaming POST behind the same lock the PUT keep-alive needs.
#[derive(Clone)]
pub struct RestApiClient {
    http: reqwest::Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
    token: Arc<RwLock<Option<String>>>,
}

impl RestApiClient {
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        RestApiClient {
            http,
            base_url,
            username: None,
            password: None,
            token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn join(&self, path: &str) -> Result<Url, S2SError> {
        self.base_url
            .join(path)
            .map_err(|e| S2SError::Protocol(format!("could not form URL for '{}': {}", path, e)))
    }

    async fn ensure_token(&self) -> Result<(), S2SError> {
        if self.username.is_some() && self.token.read().await.is_none() {
            self.fetch_token().await?;
        }
        Ok(())
    }

    async fn fetch_token(&self) -> Result<(), S2SError> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => return Ok(()),
        };
        let url = self.join("access/token")?;
        let resp = self
            .http
            .post(url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(S2SError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(S2SError::Auth(format!(
                "token request returned {}",
                resp.status()
            )));
        }
        let token = resp.text().await.map_err(S2SError::from_reqwest)?;
        info!(url = %self.base_url, "acquired access token");
        *self.token.write().await = Some(token.trim().to_owned());
        Ok(())
    }

    /// Execute `request`, and if it comes back `401` while credentials are
    /// configured, refresh the token once and retry. Requests whose body
    /// can't be cloned (the streaming "send flow files" body) skip the
    /// retry and surface the 401 as-is.
    async fn send_with_reauth(&self, request: reqwest::Request) -> Result<reqwest::Response, S2SError> {
        let retry_request = request.try_clone();
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(S2SError::from_reqwest)?;

        if resp.status() == StatusCode::UNAUTHORIZED && self.username.is_some() {
            if let Some(mut retry_request) = retry_request {
                warn!(url = %self.base_url, "received 401, refreshing token and retrying once");
                self.fetch_token().await?;
                if let Some(token) = self.token.read().await.as_ref() {
                    let header_value = format!("Bearer {token}")
                        .parse()
                        .map_err(|_| S2SError::Auth("invalid bearer token".to_owned()))?;
                    retry_request
                        .headers_mut()
                        .insert(reqwest::header::AUTHORIZATION, header_value);
                }
                return self
                    .http
                    .execute(retry_request)
                    .await
                    .map_err(S2SError::from_reqwest);
            }
        }
        Ok(resp)
    }

    async fn bearer(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.read().await.as_ref() {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    /// `GET /site-to-site/peers`
    pub async fn get_peers(&self) -> Result<Vec<Peer>, S2SError> {
        self.ensure_token().await?;
        let url = self.join("site-to-site/peers")?;
        debug!(%url, "getPeers");
        let request = self
            .bearer(self.http.get(url).header(reqwest::header::ACCEPT, "application/json"))
            .await
            .build()
            .map_err(S2SError::from_reqwest)?;
        let resp = self.send_with_reauth(request).await?;

        if resp.status() != StatusCode::OK {
            return Err(S2SError::from_status(resp.status()));
        }

        let body: PeersResponseDto = resp.json().await.map_err(|e| {
            S2SError::Protocol(format!("invalid peers JSON: {e}"))
        })?;

        Ok(body
            .peers
            .into_iter()
            .map(|p| {
                let scheme = if p.secure { "https" } else { "http" };
                let url = Url::parse(&format!("{scheme}://{}:{}", p.hostname, p.port))
                    .unwrap_or_else(|_| self.base_url.clone());
                Peer::new(url).with_flow_file_count(p.flow_file_count)
            })
            .collect())
    }

    /// `GET /site-to-site`, locating the input port named `name`.
    pub async fn get_port_id_for_name(&self, name: &str) -> Result<String, S2SError> {
        self.ensure_token().await?;
        let url = self.join("site-to-site")?;
        debug!(%url, port_name = %name, "getPortIdForName");
        let request = self
            .bearer(self.http.get(url).header(reqwest::header::ACCEPT, "application/json"))
            .await
            .build()
            .map_err(S2SError::from_reqwest)?;
        let resp = self.send_with_reauth(request).await?;

        if resp.status() != StatusCode::OK {
            return Err(S2SError::from_status(resp.status()));
        }

        let body: SiteToSiteDto = resp
            .json()
            .await
            .map_err(|e| S2SError::Protocol(format!("invalid site-to-site JSON: {e}")))?;

        let mut ports = body.input_ports;
        if let Some(controller) = body.controller {
            ports.extend(controller.input_ports);
        }

        ports
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .ok_or_else(|| S2SError::Protocol(format!("no input port named '{name}'")))
    }

    /// `POST /data-transfer/input-ports/{portId}/transactions`
    pub async fn create_transaction(&self, port_id: &str) -> Result<TransactionResource, S2SError> {
        self.ensure_token().await?;
        let url = self.join(&format!("data-transfer/input-ports/{port_id}/transactions"))?;
        debug!(%url, "createTransaction");
        let request = self
            .bearer(
                self.http
                    .post(url)
                    .header("X-Location-Uri-Intent-Value", "transaction-url"),
            )
            .await
            .build()
            .map_err(S2SError::from_reqwest)?;
        let resp = self.send_with_reauth(request).await?;

        match resp.status() {
            StatusCode::CREATED => {}
            StatusCode::SERVICE_UNAVAILABLE => {
                return Err(S2SError::Protocol(
                    "no valid peer for port (503 from createTransaction)".to_owned(),
                ));
            }
            other => return Err(S2SError::from_status(other)),
        }

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| S2SError::Protocol("createTransaction response missing Location".to_owned()))?;
        let transaction_url = Url::parse(location)
            .map_err(|e| S2SError::Protocol(format!("invalid Location header '{location}': {e}")))?;

        let ttl_secs = resp
            .headers()
            .get("Server-Side-Transaction-Ttl")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                S2SError::Protocol("createTransaction response missing Server-Side-Transaction-Ttl".to_owned())
            })?;

        let content_url = {
            let mut url = transaction_url.clone();
            let mut path = url.path().trim_end_matches('/').to_owned();
            path.push_str("/flow-files");
            url.set_path(&path);
            url
        };

        Ok(TransactionResource {
            transaction_url,
            content_url,
            server_ttl: Duration::from_secs(ttl_secs),
        })
    }

    /// `POST ${contentUrl}` — streams the encoded packet body, returns the
    /// server's decimal CRC.
    pub async fn send_flow_files(&self, content_url: &Url, body: BodyStream) -> Result<String, S2SError> {
        self.ensure_token().await?;
        debug!(url = %content_url, "sendFlowFiles");
        let reqwest_body = reqwest::Body::wrap_stream(body);
        let resp = self
            .bearer(
                self.http
                    .post(content_url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(reqwest_body),
            )
            .await
            .send()
            .await
            .map_err(S2SError::from_reqwest)?;

        if resp.status() != StatusCode::ACCEPTED {
            return Err(S2SError::from_status(resp.status()));
        }

        let text = resp.text().await.map_err(S2SError::from_reqwest)?;
        let checksum = text.trim();
        if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_digit()) {
            return Err(S2SError::Protocol(format!(
                "non-numeric checksum in sendFlowFiles response: '{text}'"
            )));
        }
        Ok(checksum.to_owned())
    }

    /// `DELETE ${txUrl}?responseCode=N&checksum=...`
    pub async fn commit_transaction(
        &self,
        transaction_url: &Url,
        checksum: &str,
        action: CommitAction,
    ) -> Result<CommitOutcome, S2SError> {
        self.ensure_token().await?;
        let mut url = transaction_url.clone();
        url.query_pairs_mut()
            .append_pair("responseCode", &action.code().to_string())
            .append_pair("checksum", checksum);
        debug!(%url, action = ?action, "commitTransaction");

        let request = self
            .bearer(self.http.delete(url))
            .await
            .build()
            .map_err(S2SError::from_reqwest)?;
        let resp = self.send_with_reauth(request).await?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::BAD_REQUEST if action == CommitAction::Confirm => {
                return Err(S2SError::ChecksumMismatch {
                    client: checksum.to_owned(),
                    server: "rejected by server".to_owned(),
                });
            }
            other => return Err(S2SError::from_status(other)),
        }

        let body: CommitResponseDto = resp
            .json()
            .await
            .map_err(|e| S2SError::Protocol(format!("invalid commit response JSON: {e}")))?;

        Ok(CommitOutcome {
            packets_transferred: body.flow_file_sent,
            duration: Duration::from_millis(body.duration_millis.unwrap_or(0)),
            message: body.message,
            should_backoff: body.should_backoff,
        })
    }

    /// `PUT ${transactionUrl}` — TTL keep-alive. Failures here are logged,
    /// not fatal, below the TTL/2 cadence that calls it.
    pub async fn extend_ttl(&self, transaction_url: &Url) -> Result<(), S2SError> {
        self.ensure_token().await?;
        let request = self
            .bearer(self.http.put(transaction_url.clone()))
            .await
            .build()
            .map_err(S2SError::from_reqwest)?;
        let resp = self.send_with_reauth(request).await?;
        if resp.status() != StatusCode::OK {
            return Err(S2SError::from_status(resp.status()));
        }
        Ok(())
    }
}
