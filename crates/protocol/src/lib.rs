//! # Tether Attach Protocol
//!
//! Wire-level building blocks shared by the guest agent and the host-side
//! attach client.
//!
//! ## Overview
//!
//! The guest is reachable only through an emulated serial device: two
//! one-directional pipes that each side opens independently. This crate
//! turns that into an authenticated, multiplexed message channel:
//!
//! - **Transport**: joins the pipes into one connection and synchronises
//!   both ends with a retrying marker handshake
//! - **Attach Key**: the pre-shared secret both ends hold
//! - **Noise Protocol**: `NNpsk0` handshake and transport encryption
//! - **Frame Codec**: magic-tagged framing with optional LZ4 compression
//! - **Message Definitions**: list, open-stream, data, control and error messages
//! - **TTY Transcoder**: control-byte escaping for terminal sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Magic-tagged, LZ4
//! ├─────────────────────────────────────────┤
//! │           Noise Encryption              │  NNpsk0, ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │   Half-Duplex Transport (sync markers)  │  serial device / FIFO pair
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use protocol::{AttachKey, HalfDuplexConn, HandshakeOptions, Role, SecureChannel, Transport};
//!
//! # async fn demo(key: AttachKey) -> protocol::Result<()> {
//! let (host, _guest) = HalfDuplexConn::memory_pair(64 * 1024);
//! host.handshake(Role::Initiator, &HandshakeOptions::default()).await?;
//! let channel = SecureChannel::initiate(Arc::new(host), &key).await?;
//! # let _ = channel;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: half-duplex connection and sync-marker handshake
//! - [`channel`]: authenticated message channel
//! - [`key`]: attach key loading and fingerprints
//! - [`messages`]: protocol message definitions
//! - [`framing`]: frame codec with compression
//! - [`noise`]: Noise NNpsk0 handshake and encryption
//! - [`tty`]: TTY transcoder
//! - [`error`]: error types

pub mod channel;
pub mod error;
pub mod framing;
pub mod key;
pub mod messages;
pub mod noise;
pub mod transport;
pub mod tty;

pub use channel::{SecureChannel, MAX_CHUNK_SIZE};
pub use error::{AttachError, ProtocolError, Result};
pub use framing::{FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};
pub use key::{AttachKey, ATTACH_KEY_LENGTH};
pub use messages::{DataStream, Envelope, ErrorCode, ErrorMessage, Message, PROTOCOL_VERSION};
pub use noise::{HandshakePhase, NoiseSession, Role, MAX_NOISE_MESSAGE_SIZE, NOISE_OVERHEAD};
pub use transport::{
    BoxFuture, HalfDuplexConn, Handshake, HandshakeOptions, PipeReader, PipeWriter, Transport,
    DEFAULT_HANDSHAKE_INTERVAL,
};
pub use tty::{EscapeDecoder, EscapeEncoder, Passthrough, Transcoder};
