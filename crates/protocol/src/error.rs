//! Error types for the protocol crate.
//!
//! [`ProtocolError`] covers transport, channel and codec failures.
//! [`AttachError`] is the client-facing taxonomy returned by stream-open
//! requests; its messages are stable and consumed verbatim by scripts.

use thiserror::Error;

use crate::messages::ErrorCode;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Attach key could not be parsed or loaded.
    #[error("invalid attach key: {0}")]
    InvalidKey(String),

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    /// The peer did not answer the transport sync marker before the deadline
    /// or the attempt was cancelled. The caller may retry.
    #[error("transport handshake timed out: {0}")]
    TransportHandshakeTimeout(String),

    /// The peer closed its end of the link before the handshake completed.
    #[error("transport closed by peer")]
    TransportClosedByPeer,

    /// The peer failed to prove knowledge of the attach key, or refused ours.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame has invalid magic bytes.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value received.
        got: u32,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Reading or writing a stream's bytes failed.
    #[error("stream I/O error: {0}")]
    StreamIo(String),
}

impl ProtocolError {
    /// Returns true for errors that end the current link and warrant a
    /// re-handshake rather than a per-request error reply.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed(_)
                | ProtocolError::TransportClosedByPeer
                | ProtocolError::Timeout(_)
                | ProtocolError::StreamIo(_)
                | ProtocolError::Decryption(_)
                | ProtocolError::InvalidFrameMagic { .. }
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => ProtocolError::Decryption(err.to_string()),
            snow::Error::State(_) | snow::Error::Pattern(_) | snow::Error::Init(_) => {
                ProtocolError::HandshakeFailed(err.to_string())
            }
            _ => ProtocolError::Encryption(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::StreamIo(err.to_string()),
        }
    }
}

/// Client-facing failures of a stream-open request.
///
/// None of these are fatal to the server. The `Display` text of
/// `NoSuchSession` and `NotRunning` is part of the external interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// No session with this id is registered.
    #[error("No such container: {0}")]
    NoSuchSession(String),

    /// The session was registered with attach disabled.
    #[error("container {0} is not attachable")]
    NotAttachable(String),

    /// Another stream is currently bound to the session.
    #[error("container {0} already has an attached stream")]
    AlreadyBound(String),

    /// The session's process has exited.
    #[error("You cannot attach to a stopped container, start it first")]
    NotRunning(String),
}

impl AttachError {
    /// Exit status reported at the command boundary for every attach failure.
    pub const EXIT_STATUS: i32 = 1;

    /// The session id the request named.
    pub fn session_id(&self) -> &str {
        match self {
            AttachError::NoSuchSession(id)
            | AttachError::NotAttachable(id)
            | AttachError::AlreadyBound(id)
            | AttachError::NotRunning(id) => id,
        }
    }

    /// Wire code carried in an error reply.
    pub fn code(&self) -> ErrorCode {
        match self {
            AttachError::NoSuchSession(_) => ErrorCode::NoSuchSession,
            AttachError::NotAttachable(_) => ErrorCode::NotAttachable,
            AttachError::AlreadyBound(_) => ErrorCode::AlreadyBound,
            AttachError::NotRunning(_) => ErrorCode::NotRunning,
        }
    }

    /// Process exit status a caller should surface.
    pub fn exit_status(&self) -> i32 {
        Self::EXIT_STATUS
    }

    /// Rebuilds the error from a wire code, if the code is an attach failure.
    pub fn from_code(code: ErrorCode, session_id: impl Into<String>) -> Option<Self> {
        let id = session_id.into();
        match code {
            ErrorCode::NoSuchSession => Some(AttachError::NoSuchSession(id)),
            ErrorCode::NotAttachable => Some(AttachError::NotAttachable(id)),
            ErrorCode::AlreadyBound => Some(AttachError::AlreadyBound(id)),
            ErrorCode::NotRunning => Some(AttachError::NotRunning(id)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_handshake_timeout_display() {
        let err = ProtocolError::TransportHandshakeTimeout("deadline of 5s elapsed".to_string());
        assert_eq!(
            err.to_string(),
            "transport handshake timed out: deadline of 5s elapsed"
        );
    }

    #[test]
    fn test_closed_by_peer_display() {
        assert_eq!(
            ProtocolError::TransportClosedByPeer.to_string(),
            "transport closed by peer"
        );
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65519,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65519 bytes"
        );
    }

    #[test]
    fn test_invalid_frame_magic_error_display() {
        let err = ProtocolError::InvalidFrameMagic {
            expected: 0x4154_4348,
            got: 0xDEAD_BEEF,
        };
        assert_eq!(
            err.to_string(),
            "invalid frame magic: expected 0x41544348, got 0xdeadbeef"
        );
    }

    #[test]
    fn test_is_link_error() {
        assert!(ProtocolError::TransportClosedByPeer.is_link_error());
        assert!(ProtocolError::ConnectionClosed("eof".into()).is_link_error());
        assert!(!ProtocolError::AuthenticationFailed("bad key".into()).is_link_error());
        assert!(!ProtocolError::TransportHandshakeTimeout("x".into()).is_link_error());
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_snow_decrypt_error() {
        let err: ProtocolError = snow::Error::Decrypt.into();
        assert!(matches!(err, ProtocolError::Decryption(_)));
    }

    #[test]
    fn test_from_io_error_eof() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::StreamIo(_)));
    }

    #[test]
    fn test_attach_error_messages_are_stable() {
        assert_eq!(
            AttachError::NoSuchSession("abc123".into()).to_string(),
            "No such container: abc123"
        );
        assert_eq!(
            AttachError::NotRunning("abc123".into()).to_string(),
            "You cannot attach to a stopped container, start it first"
        );
    }

    #[test]
    fn test_attach_error_exit_status() {
        for err in [
            AttachError::NoSuchSession("a".into()),
            AttachError::NotAttachable("a".into()),
            AttachError::AlreadyBound("a".into()),
            AttachError::NotRunning("a".into()),
        ] {
            assert_eq!(err.exit_status(), 1);
            let rebuilt = AttachError::from_code(err.code(), err.session_id()).unwrap();
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_attach_error_from_unrelated_code() {
        assert!(AttachError::from_code(ErrorCode::Internal, "a").is_none());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
        assert_send_sync::<AttachError>();
    }
}
