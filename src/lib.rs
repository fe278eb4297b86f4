//! Site-to-Site client: a peer pool, a transaction state machine, and a REST
//! protocol adapter for streaming attributed binary records ("data
//! packets") to a remote dataflow server cluster over HTTP Site-to-Site.
//!
//! A producer opens a short-lived [`transaction::Transaction`] against one
//! remote input port on one peer, streams packets through
//! [`packet::DataPacket`]/[`encoder::DataPacketEncoder`], confirms the
//! server-computed checksum, and commits or cancels atomically.
//!
//! Entry point: build a [`config::ClientConfig`], hand it to
//! [`client::Client::new`], then call [`client::Client::create_transaction`]
//! per transfer.

pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod rest;
pub mod transaction;

pub use client::Client;
pub use config::{ClientConfig, HttpClientTuning, PortRef, ProxyConfig, RemoteClusterConfig, TransportProtocol};
pub use error::S2SError;
pub use packet::DataPacket;
pub use peer::Peer;
pub use pool::{PeerRng, SeededRng};
pub use rest::{CommitAction, TransactionResource};
pub use transaction::{Transaction, TransactionResult, TransactionState};
