//! Authenticated message channel over a [`Transport`].
//!
//! ## Wire layout
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ len: u16 │ Noise ciphertext                             │
//! │   (BE)   │   └─ Frame "ATCH" (LZ4 above 1 KiB)          │
//! │          │        └─ MessagePack Envelope               │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! During authentication the same length prefix carries raw Noise
//! handshake messages. A zero-length handshake message from the responder
//! means it refused the initiator.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{ProtocolError, Result};
use crate::framing::FrameCodec;
use crate::key::AttachKey;
use crate::messages::{Envelope, Message, PROTOCOL_VERSION};
use crate::noise::{NoiseSession, MAX_NOISE_MESSAGE_SIZE};
use crate::transport::Transport;

/// Largest stream payload placed in a single data message.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// An authenticated, encrypted, ordered message channel.
pub struct SecureChannel {
    transport: Arc<dyn Transport>,
    noise: std::sync::Mutex<NoiseSession>,
    codec: FrameCodec,
    send_sequence: Mutex<u64>,
    recv_sequence: Mutex<u64>,
}

impl SecureChannel {
    /// Authenticates as the initiator (host side).
    pub async fn initiate(transport: Arc<dyn Transport>, key: &AttachKey) -> Result<Self> {
        let mut noise = NoiseSession::new_initiator(key)?;

        let hello = noise.write_handshake_message(&[])?;
        write_message(transport.as_ref(), &hello).await?;

        let reply = read_message(transport.as_ref()).await?;
        if reply.is_empty() {
            return Err(ProtocolError::AuthenticationFailed(
                "attach server refused the connection".to_string(),
            ));
        }
        noise.read_handshake_message(&reply)?;
        noise.into_transport()?;

        tracing::debug!(key = %key.fingerprint(), "secure channel established");
        Ok(Self::from_parts(transport, noise))
    }

    /// Authenticates as the responder (guest side).
    ///
    /// An initiator holding a different key is refused on the wire before
    /// the error is returned.
    pub async fn accept(transport: Arc<dyn Transport>, key: &AttachKey) -> Result<Self> {
        let mut noise = NoiseSession::new_responder(key)?;

        let hello = read_message(transport.as_ref()).await?;
        if let Err(e) = noise.read_handshake_message(&hello) {
            write_message(transport.as_ref(), &[]).await?;
            return Err(e);
        }

        let reply = noise.write_handshake_message(&[])?;
        write_message(transport.as_ref(), &reply).await?;
        noise.into_transport()?;

        tracing::debug!(key = %key.fingerprint(), "secure channel accepted");
        Ok(Self::from_parts(transport, noise))
    }

    /// Consumes an initiator's first handshake message and refuses it.
    pub async fn reject(transport: &dyn Transport) -> Result<()> {
        let _ = read_message(transport).await?;
        write_message(transport, &[]).await
    }

    fn from_parts(transport: Arc<dyn Transport>, noise: NoiseSession) -> Self {
        Self {
            transport,
            noise: std::sync::Mutex::new(noise),
            codec: FrameCodec::new(),
            send_sequence: Mutex::new(0),
            recv_sequence: Mutex::new(0),
        }
    }

    /// Sends one message. Concurrent senders are serialised.
    pub async fn send(&self, message: Message) -> Result<()> {
        let mut sequence = self.send_sequence.lock().await;
        *sequence += 1;

        let plaintext = Envelope::new(*sequence, message).to_msgpack()?;
        let frame = self.codec.encode(&plaintext)?;
        let ciphertext = self.lock_noise()?.encrypt(&frame)?;

        write_message(self.transport.as_ref(), &ciphertext).await
    }

    /// Receives the next message.
    pub async fn recv(&self) -> Result<Message> {
        let mut expected = self.recv_sequence.lock().await;

        let ciphertext = read_message(self.transport.as_ref()).await?;
        if ciphertext.is_empty() {
            return Err(ProtocolError::Deserialization(
                "empty message after authentication".to_string(),
            ));
        }
        let frame = self.lock_noise()?.decrypt(&ciphertext)?;
        let plaintext = self.codec.decode(&frame)?;
        let envelope = Envelope::from_msgpack(&plaintext)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::Deserialization(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        if envelope.sequence != *expected + 1 {
            return Err(ProtocolError::Deserialization(format!(
                "out of sequence message: expected {}, got {}",
                *expected + 1,
                envelope.sequence
            )));
        }
        *expected = envelope.sequence;

        Ok(envelope.payload)
    }

    /// Closes the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    /// The transport this channel runs on.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn lock_noise(&self) -> Result<std::sync::MutexGuard<'_, NoiseSession>> {
        self.noise
            .lock()
            .map_err(|_| ProtocolError::Encryption("noise state poisoned".to_string()))
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("established", &self.transport.is_established())
            .finish()
    }
}

async fn write_message(transport: &dyn Transport, body: &[u8]) -> Result<()> {
    let len = u16::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: body.len(),
        max: MAX_NOISE_MESSAGE_SIZE,
    })?;
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    transport.write_all(&out).await
}

async fn read_message(transport: &dyn Transport) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    read_exact(transport, &mut len).await?;
    let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
    read_exact(transport, &mut body).await?;
    Ok(body)
}

async fn read_exact(transport: &dyn Transport, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match transport.read(&mut buf[filled..]).await? {
            0 => {
                return Err(ProtocolError::ConnectionClosed(
                    "peer closed the link mid-message".to_string(),
                ))
            }
            n => filled += n,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DataStream, ListSessions, StreamData};
    use crate::transport::HalfDuplexConn;

    fn link() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let (host, guest) = HalfDuplexConn::memory_pair(64 * 1024);
        (Arc::new(host), Arc::new(guest))
    }

    #[tokio::test]
    async fn test_authenticate_and_exchange() {
        let key = AttachKey::generate();
        let (host, guest) = link();

        let (client, server) = tokio::join!(
            SecureChannel::initiate(host, &key),
            SecureChannel::accept(guest, &key)
        );
        let client = client.unwrap();
        let server = server.unwrap();

        client
            .send(Message::ListSessions(ListSessions { request_id: 1 }))
            .await
            .unwrap();
        client
            .send(Message::ListSessions(ListSessions { request_id: 2 }))
            .await
            .unwrap();

        assert_eq!(
            server.recv().await.unwrap(),
            Message::ListSessions(ListSessions { request_id: 1 })
        );
        assert_eq!(
            server.recv().await.unwrap(),
            Message::ListSessions(ListSessions { request_id: 2 })
        );
    }

    #[tokio::test]
    async fn test_wrong_key_fails_both_sides() {
        let (host, guest) = link();
        let client_key = AttachKey::generate();
        let server_key = AttachKey::generate();

        let (client, server) = tokio::join!(
            SecureChannel::initiate(host, &client_key),
            SecureChannel::accept(guest, &server_key)
        );
        assert!(matches!(client, Err(ProtocolError::AuthenticationFailed(_))));
        assert!(matches!(server, Err(ProtocolError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_reject() {
        let (host, guest) = link();
        let key = AttachKey::generate();

        let (client, rejected) = tokio::join!(
            SecureChannel::initiate(host, &key),
            SecureChannel::reject(guest.as_ref())
        );
        rejected.unwrap();
        assert!(matches!(client, Err(ProtocolError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_large_chunk_crosses_channel() {
        let key = AttachKey::generate();
        let (host, guest) = link();
        let (client, server) = tokio::join!(
            SecureChannel::initiate(host, &key),
            SecureChannel::accept(guest, &key)
        );
        let (client, server) = (client.unwrap(), server.unwrap());

        let data: Vec<u8> = (0..MAX_CHUNK_SIZE).map(|i| (i * 31 % 251) as u8).collect();
        let msg = Message::StreamData(StreamData {
            stream_id: 4,
            stream: DataStream::Stdout,
            data,
        });

        let sender = async { server.send(msg.clone()).await.unwrap() };
        let (_, received) = tokio::join!(sender, client.recv());
        assert_eq!(received.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_connection_closed() {
        let key = AttachKey::generate();
        let (host, guest) = link();
        let (client, server) = tokio::join!(
            SecureChannel::initiate(host, &key),
            SecureChannel::accept(guest, &key)
        );
        let (client, server) = (client.unwrap(), server.unwrap());

        client.close().await.unwrap();
        let err = server.recv().await.unwrap_err();
        assert!(err.is_link_error());
    }
}
