//! Wire message definitions for the attach protocol.
//!
//! Every message travels inside an [`Envelope`] serialized with MessagePack.
//! Requests that expect a reply carry a `request_id` chosen by the client;
//! the server echoes it in the matching response, acknowledgement or error.
//! Stream traffic is keyed by a client-chosen `stream_id`.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Per-direction sequence number, strictly increasing.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Registry messages
    /// Request the ids of every registered session.
    ListSessions(ListSessions),
    /// Reply to [`Message::ListSessions`].
    SessionList(SessionList),

    // Stream messages
    /// Open a stream bound to one session.
    OpenStream(OpenStream),
    /// Reply confirming a stream is bound.
    StreamOpened(StreamOpened),
    /// Bytes for one direction of a stream.
    StreamData(StreamData),
    /// One direction of a stream reached end-of-stream.
    StreamEof(StreamEof),
    /// Hard close of a whole stream by the client.
    StreamClose(StreamClose),
    /// The bound process exited; sent after its output is flushed.
    SessionExited(SessionExited),

    // Out-of-band control
    /// Resize the session's terminal.
    Resize(ResizeRequest),
    /// Deliver a signal to the session's process.
    Signal(SignalRequest),
    /// Close the process stdin without detaching.
    CloseStdin(CloseStdin),
    /// Completion of a control request.
    ControlAck(ControlAck),

    // Connection messages
    /// Liveness check.
    Ping(Ping),
    /// Reply to [`Message::Ping`].
    Pong(Pong),
    /// Error reply to a request.
    Error(ErrorMessage),
}

// ============================================================================
// Registry Messages
// ============================================================================

/// Request to enumerate session ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSessions {
    /// Correlates the reply.
    pub request_id: u64,
}

/// Session ids known to the guest, in no particular order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    /// Echo of the request id.
    pub request_id: u64,
    /// Registered session ids.
    pub session_ids: Vec<String>,
}

// ============================================================================
// Stream Messages
// ============================================================================

/// Request to bind a new stream to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStream {
    /// Correlates the reply.
    pub request_id: u64,
    /// Client-chosen stream id, unique per connection.
    pub stream_id: u32,
    /// Target session.
    pub session_id: String,
    /// Replay retained output only; allowed on exited sessions.
    pub log_only: bool,
}

/// Confirmation that a stream is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpened {
    /// Echo of the request id.
    pub request_id: u64,
    /// The bound stream.
    pub stream_id: u32,
    /// Whether the session runs on a pseudo-terminal.
    pub tty: bool,
}

/// Stream payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamData {
    /// Stream the bytes belong to.
    pub stream_id: u32,
    /// Direction of the bytes.
    pub stream: DataStream,
    /// The actual data bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Data stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStream {
    /// Standard input (client to guest).
    Stdin,
    /// Standard output (guest to client).
    Stdout,
    /// Standard error (guest to client).
    Stderr,
}

/// End-of-stream for one direction.
///
/// From the client, `Stdin` end-of-stream detaches the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEof {
    /// Affected stream.
    pub stream_id: u32,
    /// Direction that ended.
    pub stream: DataStream,
}

/// Hard close of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClose {
    /// Stream to close.
    pub stream_id: u32,
}

/// Process exit notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExited {
    /// Stream bound to the exited session.
    pub stream_id: u32,
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Terminal resize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Correlates the acknowledgement.
    pub request_id: u64,
    /// Stream whose session is resized.
    pub stream_id: u32,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Signal delivery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Correlates the acknowledgement.
    pub request_id: u64,
    /// Stream whose session receives the signal.
    pub stream_id: u32,
    /// Conventional signal name such as `HUP` or `SIGTERM`.
    pub name: String,
}

/// Request to close the process stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseStdin {
    /// Correlates the acknowledgement.
    pub request_id: u64,
    /// Target stream.
    pub stream_id: u32,
}

/// Acknowledgement of a control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    /// Echo of the request id.
    pub request_id: u64,
}

// ============================================================================
// Connection Messages
// ============================================================================

/// Ping for keepalive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Correlates the pong.
    pub request_id: u64,
}

/// Pong response to ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Echo of the request id.
    pub request_id: u64,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Request that failed, when the error answers one.
    pub request_id: Option<u64>,
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (the session id for attach failures).
    pub context: Option<String>,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Session id not registered.
    NoSuchSession,
    /// Session does not permit attach.
    NotAttachable,
    /// A stream is already bound to the session.
    AlreadyBound,
    /// The session's process has exited.
    NotRunning,
    /// Resize on a session without a terminal.
    NotTty,
    /// Unknown signal name.
    InvalidSignal,
    /// Control request for a stream whose process has exited.
    ProcessExited,
    /// A stream's queued stdin exceeded its limit; the stream was detached.
    InputOverflow,
    /// Malformed or out-of-order request.
    InvalidRequest,
    /// Server-side error.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_envelope(msg: Message) {
        let envelope = Envelope::new(7, msg);
        let bytes = envelope.to_msgpack().unwrap();
        let decoded = Envelope::from_msgpack(&bytes).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_envelope_defaults_to_current_version() {
        let envelope = Envelope::new(1, Message::Ping(Ping { request_id: 3 }));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert_eq!(envelope.sequence, 1);
    }

    #[test]
    fn test_open_stream_roundtrip() {
        roundtrip_envelope(Message::OpenStream(OpenStream {
            request_id: 42,
            stream_id: 3,
            session_id: "tee1".to_string(),
            log_only: false,
        }));
    }

    #[test]
    fn test_stream_data_binary_roundtrip() {
        roundtrip_envelope(Message::StreamData(StreamData {
            stream_id: 1,
            stream: DataStream::Stdout,
            data: (0..=255u8).collect(),
        }));
    }

    #[test]
    fn test_stream_data_uses_bin_encoding() {
        let envelope = Envelope::new(
            1,
            Message::StreamData(StreamData {
                stream_id: 1,
                stream: DataStream::Stdin,
                data: vec![0xAB; 64],
            }),
        );
        let bytes = envelope.to_msgpack().unwrap();
        // serde_bytes keeps the payload as a single bin blob, not an array of ints
        assert!(bytes.len() < 64 + 48);
    }

    #[test]
    fn test_error_roundtrip() {
        roundtrip_envelope(Message::Error(ErrorMessage {
            request_id: Some(9),
            code: ErrorCode::NoSuchSession,
            message: "No such container: ghost".to_string(),
            context: Some("ghost".to_string()),
        }));
    }

    #[test]
    fn test_control_roundtrip() {
        roundtrip_envelope(Message::Signal(SignalRequest {
            request_id: 5,
            stream_id: 2,
            name: "HUP".to_string(),
        }));
        roundtrip_envelope(Message::Resize(ResizeRequest {
            request_id: 6,
            stream_id: 2,
            cols: 132,
            rows: 43,
        }));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Envelope::from_msgpack(&[0xc1, 0x00, 0x01]).is_err());
    }
}
