//! [`DataPacket`]: an attribute bag plus an opaque byte payload.

use std::collections::HashMap;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

/// Where a [`DataPacket`]'s payload bytes come from.
///
/// `Stream`'s `u64` is the declared length; the encoder treats any mismatch
/// between that length and the bytes actually read as a hard error (see
/// `4.A Data-Packet Encoder`).
pub enum PayloadSource {
    Bytes(Bytes),
    Stream(Pin<Box<dyn AsyncRead + Send>>, u64),
}

impl std::fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadSource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            PayloadSource::Stream(_, len) => f.debug_tuple("Stream").field(len).finish(),
        }
    }
}

/// An attributed binary record, the atomic unit transferred in one
/// Site-to-Site transaction.
///
/// Created by the producer and consumed once when handed to
/// [`crate::transaction::Transaction::send_data`]; a transaction never
/// mutates the packets it is given.
#[derive(Debug)]
pub struct DataPacket {
    attributes: HashMap<String, String>,
    payload: PayloadSource,
}

impl DataPacket {
    /// Build a packet from a fully materialized buffer.
    pub fn new(attributes: HashMap<String, String>, data: impl Into<Bytes>) -> Self {
        DataPacket {
            attributes,
            payload: PayloadSource::Bytes(data.into()),
        }
    }

    /// Build a packet from a pull-stream of known length.
    ///
    /// `data_length` must equal the number of bytes `stream` will yield;
    /// the encoder marks the owning transaction `ERROR` if it does not
    /// (`4.A`, failure clause).
    pub fn from_stream(
        attributes: HashMap<String, String>,
        stream: impl AsyncRead + Send + 'static,
        data_length: u64,
    ) -> Self {
        DataPacket {
            attributes,
            payload: PayloadSource::Stream(Box::pin(stream), data_length),
        }
    }

    /// Convenience constructor for a single UTF-8 string payload with no
    /// attributes.
    pub fn from_string(s: impl Into<String>) -> Self {
        DataPacket {
            attributes: HashMap::new(),
            payload: PayloadSource::Bytes(Bytes::from(s.into().into_bytes())),
        }
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// The number of bytes the payload source will yield.
    pub fn data_length(&self) -> u64 {
        match &self.payload {
            PayloadSource::Bytes(b) => b.len() as u64,
            PayloadSource::Stream(_, len) => *len,
        }
    }

    pub(crate) fn into_parts(self) -> (HashMap<String, String>, PayloadSource) {
        (self.attributes, self.payload)
    }
}
