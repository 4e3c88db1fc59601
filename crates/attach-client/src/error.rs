//! Client error type.

use protocol::{AttachError, ErrorCode, ErrorMessage, ProtocolError};
use thiserror::Error;

/// Exit status for failures that are not attach refusals.
pub const GENERIC_EXIT_STATUS: i32 = 2;

/// Errors surfaced by [`AttachClient`](crate::AttachClient) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server refused to open the stream.
    #[error(transparent)]
    Attach(#[from] AttachError),

    /// The server rejected a control request.
    #[error("{message}")]
    Rejected {
        /// Wire code of the rejection.
        code: ErrorCode,
        /// Server-provided text.
        message: String,
    },

    /// Link, codec or authentication failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection to the server went away.
    #[error("attach server disconnected")]
    Disconnected,

    /// The server answered with a message of the wrong kind.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    /// Builds the error carried by a refused stream-open request for
    /// `session_id`.
    pub fn from_open_reply(reply: ErrorMessage, session_id: &str) -> Self {
        let id = reply
            .context
            .clone()
            .unwrap_or_else(|| session_id.to_string());
        match AttachError::from_code(reply.code, id) {
            Some(attach) => ClientError::Attach(attach),
            None => ClientError::from_reply(reply),
        }
    }

    /// Builds the error carried by any other error reply. Attach kinds are
    /// never rebuilt here: a control request is not an attach.
    pub fn from_reply(reply: ErrorMessage) -> Self {
        ClientError::Rejected {
            code: reply.code,
            message: reply.message,
        }
    }

    /// The attach refusal, if this is one.
    pub fn attach_error(&self) -> Option<&AttachError> {
        match self {
            ClientError::Attach(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the session does not exist.
    pub fn is_no_such_session(&self) -> bool {
        matches!(self, ClientError::Attach(AttachError::NoSuchSession(_)))
    }

    /// Whether the session's process already exited.
    pub fn is_not_running(&self) -> bool {
        matches!(self, ClientError::Attach(AttachError::NotRunning(_)))
    }

    /// Process exit status a command-line caller should report.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Attach(e) => e.exit_status(),
            _ => GENERIC_EXIT_STATUS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: ErrorCode, message: &str, context: Option<&str>) -> ErrorMessage {
        ErrorMessage {
            request_id: Some(1),
            code,
            message: message.to_string(),
            context: context.map(str::to_string),
        }
    }

    #[test]
    fn test_not_running_keeps_verbatim_text() {
        let err = ClientError::from_open_reply(
            reply(ErrorCode::NotRunning, "ignored", Some("web")),
            "web",
        );
        assert!(err.is_not_running());
        assert_eq!(
            err.to_string(),
            "You cannot attach to a stopped container, start it first"
        );
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_no_such_session_uses_request_id_without_context() {
        let err = ClientError::from_open_reply(reply(ErrorCode::NoSuchSession, "", None), "ghost");
        assert!(err.is_no_such_session());
        assert_eq!(err.to_string(), "No such container: ghost");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_open_reply_with_other_code() {
        let err = ClientError::from_open_reply(
            reply(ErrorCode::InvalidRequest, "stream 1 already open", Some("web")),
            "web",
        );
        assert!(matches!(err, ClientError::Rejected { code: ErrorCode::InvalidRequest, .. }));
        assert_eq!(err.exit_code(), GENERIC_EXIT_STATUS);
    }

    #[test]
    fn test_control_rejection() {
        let err = ClientError::from_reply(reply(
            ErrorCode::NotTty,
            "session web has no terminal",
            Some("web"),
        ));
        assert!(matches!(err, ClientError::Rejected { code: ErrorCode::NotTty, .. }));
        assert_eq!(err.to_string(), "session web has no terminal");
        assert_eq!(err.exit_code(), GENERIC_EXIT_STATUS);
    }

    #[test]
    fn test_control_on_exited_process_is_not_an_attach_refusal() {
        for code in [ErrorCode::ProcessExited, ErrorCode::NotRunning] {
            let err = ClientError::from_reply(reply(code, "process exited: web", Some("web")));
            assert!(err.attach_error().is_none());
            assert!(!err.is_not_running());
            assert_eq!(err.to_string(), "process exited: web");
            assert_eq!(err.exit_code(), GENERIC_EXIT_STATUS);
        }
    }

    #[test]
    fn test_disconnected_exit_code() {
        assert_eq!(ClientError::Disconnected.exit_code(), GENERIC_EXIT_STATUS);
        assert!(ClientError::Disconnected.attach_error().is_none());
    }
}
