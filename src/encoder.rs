//! Data-Packet Encoder — wire format and running CRC32 for the S2S
//! "send flow files" request body.
//!
//! Wire format per packet (see `4.A Data-Packet Encoder`):
//!
//! ```text
//! attributeCount: u32 BE
//! for each attribute:
//!     keyLen: u32 BE, key bytes (UTF-8)
//!     valLen: u32 BE, val bytes (UTF-8)
//! payloadLen: u64 BE
//! payload bytes (exactly payloadLen)
//! ```
//!
//! The encoder writes into one end of an mpsc channel; the receiving end is
//! wrapped as a [`BodyStream`] and handed to `reqwest::Body::wrap_stream` so
//! the HTTP layer can consume the body lazily as `send_data` calls push
//! packets in, without buffering the whole batch in memory.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::S2SError;
use crate::packet::{DataPacket, PayloadSource};

/// The lazily-consumed body stream fed by a [`DataPacketEncoder`].
pub type BodyStream = ReceiverStream<Result<Bytes, io::Error>>;

/// Write-once, forward-only encoder for one transaction's packet stream.
///
/// Owned exclusively by one [`crate::transaction::Transaction`].
pub struct DataPacketEncoder {
    hasher: Option<Hasher>,
    tx: Option<mpsc::Sender<Result<Bytes, io::Error>>>,
    final_crc: Option<String>,
}

impl DataPacketEncoder {
    /// Create an encoder and the body stream it feeds.
    ///
    /// `channel_capacity` bounds how far the encoder can run ahead of the
    /// HTTP layer's consumption of the body before `write_packet` blocks
    /// (the backpressure point named in `5. CONCURRENCY & RESOURCE MODEL`).
    pub fn new(channel_capacity: usize) -> (Self, BodyStream) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (
            DataPacketEncoder {
                hasher: Some(Hasher::new()),
                tx: Some(tx),
                final_crc: None,
            },
            ReceiverStream::new(rx),
        )
    }

    /// Encode one packet and push its bytes into the body stream.
    ///
    /// Returns an error if the payload stream underruns or overruns its
    /// declared length; the caller (the owning `Transaction`) is expected to
    /// transition to `ERROR` in that case.
    pub async fn write_packet(&mut self, packet: DataPacket) -> Result<(), S2SError> {
        let tx = self
            .tx
            .clone()
            .ok_or_else(|| S2SError::Protocol("encoder already closed".to_owned()))?;
        let hasher = self
            .hasher
            .as_mut()
            .ok_or_else(|| S2SError::Protocol("encoder already closed".to_owned()))?;

        let (attributes, payload) = packet.into_parts();

        let mut header = BytesMut::new();
        header.put_u32(attributes.len() as u32);
        for (key, val) in &attributes {
            let key_bytes = key.as_bytes();
            let val_bytes = val.as_bytes();
            header.put_u32(key_bytes.len() as u32);
            header.put_slice(key_bytes);
            header.put_u32(val_bytes.len() as u32);
            header.put_slice(val_bytes);
        }

        let declared_len = match &payload {
            PayloadSource::Bytes(b) => b.len() as u64,
            PayloadSource::Stream(_, len) => *len,
        };
        header.put_u64(declared_len);

        let header = header.freeze();
        hasher.update(&header);
        Self::send_chunk(&tx, header).await?;

        match payload {
            PayloadSource::Bytes(buf) => {
                hasher.update(&buf);
                Self::send_chunk(&tx, buf).await?;
            }
            PayloadSource::Stream(mut reader, declared_len) => {
                let mut remaining = declared_len;
                let mut read_buf = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let want = read_buf.len().min(remaining as usize);
                    let n = reader
                        .read(&mut read_buf[..want])
                        .await
                        .map_err(|e| S2SError::Transport(e.to_string()))?;
                    if n == 0 {
                        return Err(S2SError::Protocol(format!(
                            "payload stream underrun: {} bytes short of declared length {}",
                            remaining, declared_len
                        )));
                    }
                    let chunk = Bytes::copy_from_slice(&read_buf[..n]);
                    hasher.update(&chunk);
                    Self::send_chunk(&tx, chunk).await?;
                    remaining -= n as u64;
                }

                // Confirm there isn't excess data beyond the declared length.
                let mut probe = [0u8; 1];
                let n = reader
                    .read(&mut probe)
                    .await
                    .map_err(|e| S2SError::Transport(e.to_string()))?;
                if n != 0 {
                    return Err(S2SError::Protocol(
                        "payload stream yielded more bytes than declared length".to_owned(),
                    ));
                }
            }
        }

        Ok(())
    }

    async fn send_chunk(
        tx: &mpsc::Sender<Result<Bytes, io::Error>>,
        data: Bytes,
    ) -> Result<(), S2SError> {
        tx.send(Ok(data))
            .await
            .map_err(|_| S2SError::Transport("send-data body receiver dropped".to_owned()))
    }

    /// Close the stream and return the final CRC32-IEEE as a decimal string.
    ///
    /// Idempotent: calling it again after the first close returns the same
    /// value without touching the (already dropped) sender.
    pub fn finish(&mut self) -> String {
        if let Some(crc) = &self.final_crc {
            return crc.clone();
        }
        let crc = self.hasher.take().unwrap_or_default().finalize();
        let crc = crc.to_string();
        self.final_crc = Some(crc.clone());
        self.tx = None;
        crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::collections::HashMap;

    async fn drain(stream: BodyStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        chunks.concat()
    }

    #[tokio::test]
    async fn encodes_single_packet_matching_wire_format() {
        let (mut enc, body) = DataPacketEncoder::new(8);
        let mut attrs = HashMap::new();
        attrs.insert("filename".to_owned(), "a".to_owned());
        let packet = DataPacket::new(attrs, Bytes::from_static(b"hi"));

        let write = tokio::spawn(async move {
            enc.write_packet(packet).await.unwrap();
            enc.finish()
        });

        let bytes = drain(body).await;
        let crc = write.await.unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&8u32.to_be_bytes());
        expected.extend_from_slice(b"filename");
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(b"a");
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(b"hi");

        assert_eq!(bytes, expected);

        let mut hasher = Hasher::new();
        hasher.update(&expected);
        assert_eq!(crc, hasher.finalize().to_string());
    }

    #[tokio::test]
    async fn encodes_zero_attribute_zero_length_payload_packet() {
        let (mut enc, body) = DataPacketEncoder::new(8);
        let packet = DataPacket::new(HashMap::new(), Bytes::new());

        let write = tokio::spawn(async move {
            enc.write_packet(packet).await.unwrap();
            enc.finish()
        });

        let bytes = drain(body).await;
        write.await.unwrap();

        assert_eq!(
            bytes,
            [0u32.to_be_bytes().as_slice(), &0u64.to_be_bytes()].concat()
        );
    }

    #[tokio::test]
    async fn multiple_packets_extend_the_same_running_crc() {
        let (mut enc, body) = DataPacketEncoder::new(8);
        let p1 = DataPacket::from_string("one");
        let p2 = DataPacket::from_string("two");

        let write = tokio::spawn(async move {
            enc.write_packet(p1).await.unwrap();
            enc.write_packet(p2).await.unwrap();
            enc.finish()
        });

        let bytes = drain(body).await;
        let crc = write.await.unwrap();

        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        assert_eq!(crc, hasher.finalize().to_string());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let (mut enc, body) = DataPacketEncoder::new(8);
        let packet = DataPacket::from_string("x");
        let write = tokio::spawn(async move {
            enc.write_packet(packet).await.unwrap();
            let a = enc.finish();
            let b = enc.finish();
            (a, b)
        });
        let _ = drain(body).await;
        let (a, b) = write.await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn stream_payload_underrun_is_an_error() {
        use tokio::io::AsyncRead;
        use std::pin::Pin;
        use std::task::{Context, Poll};

        struct ShortStream(usize);
        impl AsyncRead for ShortStream {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                if self.0 == 0 {
                    return Poll::Ready(Ok(()));
                }
                buf.put_slice(b"x");
                self.0 -= 1;
                Poll::Ready(Ok(()))
            }
        }

        let (mut enc, body) = DataPacketEncoder::new(8);
        let packet = DataPacket::from_stream(HashMap::new(), ShortStream(2), 5);

        let write = tokio::spawn(async move { enc.write_packet(packet).await });
        let _ = drain(body).await;
        let result = write.await.unwrap();
        assert!(matches!(result, Err(S2SError::Protocol(_))));
    }
}
