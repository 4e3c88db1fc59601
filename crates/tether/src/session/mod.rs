//! Session management module.
//!
//! This module provides the session registry, per-session lifecycle state,
//! the output relays that keep detached processes drained, and the process
//! launcher that feeds them.

pub mod process;
pub mod registry;
pub mod relay;
pub mod state;

pub use process::{CommandSpec, ProcessLauncher};
pub use registry::SessionRegistry;
pub use relay::{OutputEvent, OutputReceiver, OutputRelay};
pub use state::{
    parse_signal, Binding, ProcessControl, ProcessOutput, ProcessStdin, Session, SessionConfig,
    SessionError, SessionId, SessionIo, SessionStatus,
};
