//! Transaction (`4.C`): one producer-to-peer transfer's state machine.
//!
//! Owns a streaming body fed by [`crate::encoder::DataPacketEncoder`] and a
//! background TTL keep-alive ticker (`5. CONCURRENCY & RESOURCE MODEL`).
//! Not safe for concurrent use by multiple producers — it owns an ordered
//! byte stream (`5`, "Scheduling model").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoder::DataPacketEncoder;
use crate::error::S2SError;
use crate::packet::DataPacket;
use crate::peer::Peer;
use crate::rest::{CommitAction, CommitOutcome, RestApiClient, TransactionResource};

/// Bound on how long `cancel()` waits for the best-effort `commit(CANCEL)`
/// call (`5`, "Suspension points").
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// One of `STARTED`, `DATA_EXCHANGED`, `CONFIRMED`, `COMPLETED`, `CANCELED`,
/// `ERROR` (`3. DATA MODEL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Started,
    DataExchanged,
    Confirmed,
    Completed,
    Canceled,
    Error,
}

impl TransactionState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Canceled | TransactionState::Error
        )
    }

    fn label(self) -> &'static str {
        match self {
            TransactionState::Started => "STARTED",
            TransactionState::DataExchanged => "DATA_EXCHANGED",
            TransactionState::Confirmed => "CONFIRMED",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Canceled => "CANCELED",
            TransactionState::Error => "ERROR",
        }
    }
}

/// Emitted on a successful `confirmAndComplete` (`3. DATA MODEL`).
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub packets_transferred: u64,
    pub duration: Duration,
    pub message: Option<String>,
    pub should_backoff: bool,
}

impl From<CommitOutcome> for TransactionResult {
    fn from(outcome: CommitOutcome) -> Self {
        TransactionResult {
            packets_transferred: outcome.packets_transferred,
            duration: outcome.duration,
            message: outcome.message,
            should_backoff: outcome.should_backoff,
        }
    }
}

/// One transaction: a single producer-to-peer transfer driven through
/// create (already done by the time this is constructed) → send → confirm →
/// commit/cancel.
pub struct Transaction {
    adapter: RestApiClient,
    resource: TransactionResource,
    port_id: String,
    peer: Peer,
    /// Client-generated correlation id, distinct from anything the server
    /// assigns; ties together the send/confirm/commit log lines for one
    /// transaction the way `uplink::send_batch`'s `batch_id` does.
    transaction_id: String,
    state: TransactionState,
    encoder: Option<DataPacketEncoder>,
    packets_sent: u64,
    keep_alive: Arc<AtomicBool>,
    ttl_stop: Option<watch::Sender<()>>,
    ttl_handle: Option<JoinHandle<()>>,
    send_handle: Option<JoinHandle<Result<String, S2SError>>>,
    started_at: Instant,
    on_failure: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Transaction {
    /// `adapter` is cloned for the background send-data and TTL tasks — see
    /// `RestApiClient`'s doc comment for why that's cheap and safe to do
    /// concurrently. `keep_alive` gates whether the TTL ticker runs at all
    /// (some callers may prefer to manage TTL extension themselves).
    pub(crate) fn new(
        adapter: RestApiClient,
        resource: TransactionResource,
        port_id: String,
        peer: Peer,
        keep_alive: bool,
        on_failure: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        let (encoder, body) = DataPacketEncoder::new(16);

        let send_adapter = adapter.clone();
        let content_url = resource.content_url.clone();
        let send_handle = tokio::spawn(async move { send_adapter.send_flow_files(&content_url, body).await });

        let keep_alive_flag = Arc::new(AtomicBool::new(keep_alive));
        let (ttl_stop, ttl_handle) = if keep_alive {
            spawn_ttl_ticker(adapter.clone(), resource.transaction_url.clone(), resource.server_ttl, keep_alive_flag.clone())
        } else {
            (None, None)
        };

        Transaction {
            adapter,
            resource,
            port_id,
            peer,
            transaction_id: Uuid::new_v4().to_string(),
            state: TransactionState::Started,
            encoder: Some(encoder),
            packets_sent: 0,
            keep_alive: keep_alive_flag,
            ttl_stop,
            ttl_handle,
            send_handle: Some(send_handle),
            started_at: Instant::now(),
            on_failure,
        }
    }

    /// The remote input port this transaction is sending to.
    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    /// Client-side correlation id for this transaction's log lines; has no
    /// meaning to the server.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Encode and push one packet into the streaming body.
    ///
    /// Legal only in `STARTED` or `DATA_EXCHANGED` (`4.C` invariants); any
    /// other state fails fast with [`S2SError::IllegalState`]. An encoder
    /// error (payload under/overrun) transitions the transaction to `ERROR`.
    pub async fn send_data(&mut self, packet: DataPacket) -> Result<(), S2SError> {
        if !matches!(self.state, TransactionState::Started | TransactionState::DataExchanged) {
            return Err(S2SError::IllegalState {
                operation: "sendData",
                state: self.state.label(),
            });
        }

        let encoder = self.encoder.as_mut().ok_or(S2SError::IllegalState {
            operation: "sendData",
            state: self.state.label(),
        })?;

        match encoder.write_packet(packet).await {
            Ok(()) => {
                self.packets_sent += 1;
                self.state = TransactionState::DataExchanged;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "send_data failed, transitioning to ERROR");
                self.fail_locally();
                Err(e)
            }
        }
    }

    /// Close the encoder, await the server's checksum, and commit.
    ///
    /// Legal in `STARTED` (an empty batch) or `DATA_EXCHANGED`. On a
    /// checksum match, issues `commit(CONFIRM)` and ends in `COMPLETED`; on
    /// mismatch, issues `commit(BAD_CHECKSUM)` and ends in `ERROR` with
    /// [`S2SError::ChecksumMismatch`] (`4.C`, "Checksum protocol").
    pub async fn confirm_and_complete(&mut self) -> Result<TransactionResult, S2SError> {
        if !matches!(self.state, TransactionState::Started | TransactionState::DataExchanged) {
            return Err(S2SError::IllegalState {
                operation: "confirmAndComplete",
                state: self.state.label(),
            });
        }

        let client_crc = self
            .encoder
            .as_mut()
            .ok_or(S2SError::IllegalState {
                operation: "confirmAndComplete",
                state: self.state.label(),
            })?
            .finish();
        // Dropping the encoder drops its sender half, closing the body
        // stream so the in-flight POST can finally receive its response.
        self.encoder = None;

        let send_handle = self.send_handle.take().expect("send_handle set for a non-terminal transaction");
        let server_crc = match send_handle.await {
            Ok(Ok(crc)) => crc,
            Ok(Err(e)) => {
                self.note_failure(&e);
                self.fail_locally();
                return Err(e);
            }
            Err(join_err) => {
                self.fail_locally();
                return Err(S2SError::Transport(format!("send-data task did not complete: {join_err}")));
            }
        };

        if client_crc.trim() == server_crc.trim() {
            self.state = TransactionState::Confirmed;
            match self.commit(CommitAction::Confirm, &client_crc).await {
                Ok(outcome) => {
                    self.state = TransactionState::Completed;
                    self.stop_ticker();
                    info!(
                        transaction_id = %self.transaction_id,
                        peer = %self.peer.url(),
                        packets = outcome.packets_transferred,
                        elapsed = ?self.started_at.elapsed(),
                        "transaction completed"
                    );
                    Ok(outcome.into())
                }
                Err(e) => {
                    self.note_failure(&e);
                    self.fail_locally();
                    Err(e)
                }
            }
        } else {
            warn!(client = %client_crc, server = %server_crc, "checksum mismatch, canceling transaction");
            if let Err(e) = self.commit(CommitAction::BadChecksum, &client_crc).await {
                debug!(error = %e, "commit(BAD_CHECKSUM) itself failed; transaction is ERROR regardless");
            }
            self.fail_locally();
            Err(S2SError::ChecksumMismatch {
                client: client_crc,
                server: server_crc,
            })
        }
    }

    /// Best-effort `commit(CANCEL)`, bounded by [`CANCEL_TIMEOUT`]. A
    /// no-op if already terminal (`4.C` invariants).
    pub async fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        let crc = self.encoder.as_mut().map(|e| e.finish()).unwrap_or_default();
        self.encoder = None;
        if let Some(handle) = self.send_handle.take() {
            handle.abort();
        }

        match tokio::time::timeout(CANCEL_TIMEOUT, self.commit(CommitAction::Cancel, &crc)).await {
            Ok(Ok(_)) => debug!(transaction_id = %self.transaction_id, peer = %self.peer.url(), "transaction canceled"),
            Ok(Err(e)) => {
                self.note_failure(&e);
                warn!(error = %e, "best-effort cancel commit failed, abandoning");
            }
            Err(_) => warn!("best-effort cancel commit timed out, abandoning"),
        }

        self.state = TransactionState::Canceled;
        self.stop_ticker();
    }

    /// Abandon the transaction locally with no server call — the server
    /// reclaims it once the TTL lapses (`4.C`, "Cancel/error"). A no-op if
    /// already terminal.
    pub fn error(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(handle) = self.send_handle.take() {
            handle.abort();
        }
        self.encoder = None;
        self.state = TransactionState::Error;
        self.stop_ticker();
    }

    async fn commit(&self, action: CommitAction, checksum: &str) -> Result<CommitOutcome, S2SError> {
        self.adapter.commit_transaction(&self.resource.transaction_url, checksum, action).await
    }

    fn fail_locally(&mut self) {
        self.state = TransactionState::Error;
        self.stop_ticker();
    }

    fn note_failure(&self, err: &S2SError) {
        if err.is_peer_failure() {
            if let Some(cb) = &self.on_failure {
                cb();
            }
        }
    }

    fn stop_ticker(&mut self) {
        self.keep_alive.store(false, Ordering::Relaxed);
        if let Some(tx) = self.ttl_stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.ttl_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.stop_ticker();
        if let Some(handle) = self.send_handle.take() {
            handle.abort();
        }
    }
}

/// Spawn the TTL keep-alive ticker: an owned background worker holding only
/// the transaction URL, a cloned adapter handle, and the atomic
/// `shouldKeepAlive` flag, stopped via a dropped `watch` sender (`4.C`,
/// `9. DESIGN NOTES`).
fn spawn_ttl_ticker(
    adapter: RestApiClient,
    transaction_url: reqwest::Url,
    server_ttl: Duration,
    keep_alive: Arc<AtomicBool>,
) -> (Option<watch::Sender<()>>, Option<JoinHandle<()>>) {
    let (stop_tx, mut stop_rx) = watch::channel(());
    let period = Duration::from_secs(server_ttl.as_secs().div_ceil(2).max(1));

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick is immediate; the transaction just started
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = interval.tick() => {
                    if !keep_alive.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = adapter.extend_ttl(&transaction_url).await {
                        warn!(url = %transaction_url, error = %e, "TTL keep-alive extension failed");
                    }
                }
            }
        }
    });

    (Some(stop_tx), Some(handle))
}
