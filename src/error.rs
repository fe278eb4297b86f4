//! Closed error taxonomy for the Site-to-Site client.
//!
//! Every fallible operation in this crate returns [`S2SError`]. HTTP status
//! codes are preserved in [`S2SError::HttpStatus`] rather than folded into a
//! single numeric error space.

use thiserror::Error;

/// Errors produced by the Site-to-Site client.
#[derive(Debug, Error)]
pub enum S2SError {
    /// Missing/conflicting `portId`/`portName`, empty remote-cluster list,
    /// or a malformed URL in a [`crate::config::RemoteClusterConfig`].
    #[error("config error: {0}")]
    Config(String),

    /// The peer pool has no candidate peer, after discovery and failure
    /// marking, to attempt a transaction against.
    #[error("no peers available")]
    NoPeersAvailable,

    /// A REST call returned a status code outside the operation's expected
    /// set (see the operation table in `4.B REST Adapter`).
    #[error("unexpected HTTP status {code}")]
    HttpStatus {
        code: u16,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Socket/DNS/TLS failure, or any other transport-level error that never
    /// produced a status code.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credential rejection, or failure to acquire/refresh a bearer token.
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed server response: missing `Location` header, unparseable
    /// JSON, or a non-numeric checksum.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client's CRC did not match the server's CRC at confirm time.
    #[error("checksum mismatch: client={client} server={server}")]
    ChecksumMismatch { client: String, server: String },

    /// An API call was made that is illegal in the transaction's current
    /// state (e.g. `sendData` after `confirmAndComplete`).
    #[error("illegal state: {operation} is not valid in state {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },

    /// The caller canceled the transaction.
    #[error("transaction canceled")]
    Canceled,
}

impl S2SError {
    /// Build an [`S2SError::HttpStatus`] from a response whose status this
    /// crate does not treat as success for the operation being performed.
    pub(crate) fn from_status(code: reqwest::StatusCode) -> Self {
        S2SError::HttpStatus {
            code: code.as_u16(),
            source: None,
        }
    }

    /// Wrap a lower-level `reqwest::Error`, classifying it as a status error
    /// when it carries one, and as a transport error otherwise.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            S2SError::HttpStatus {
                code: status.as_u16(),
                source: Some(err),
            }
        } else {
            S2SError::Transport(err.to_string())
        }
    }

    /// Whether this error should be attributed to the peer the call was
    /// bound to, i.e. whether the pool should mark that peer failed and a
    /// caller should try a different one (`4.D` "Failure marking", `4.E`
    /// step 4). Transport failures and 5xx statuses qualify; the adapter's
    /// 503-from-createTransaction message is a `Protocol` variant (see
    /// `rest::RestApiClient::create_transaction`) but still peer-scoped.
    pub(crate) fn is_peer_failure(&self) -> bool {
        match self {
            S2SError::Transport(_) => true,
            S2SError::HttpStatus { code, .. } => *code >= 500,
            S2SError::Protocol(msg) => msg.contains("no valid peer"),
            _ => false,
        }
    }
}
