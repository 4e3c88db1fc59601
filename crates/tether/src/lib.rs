//! # Tether Guest Agent
//!
//! This crate runs inside an isolated guest and lets a host-side client
//! attach to the guest's processes over an emulated serial link.
//!
//! ## Overview
//!
//! The agent owns the processes it starts and exposes them as named
//! sessions:
//!
//! - **Session Registry**: named sessions with detach and reattach, output
//!   buffered while nobody is attached
//! - **Process Launcher**: piped or PTY-backed children, start deferred
//!   until the first attach when requested
//! - **Attach Server**: the guest end of the authenticated multiplexed
//!   protocol, one client at a time
//! - **Link**: the serial pipe pair, reopened when it fails, with the
//!   connection resumed across the swap
//! - **Liveness Keys**: small key/value records the host polls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Agent                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │   Session    │  │   Process    │  │      Liveness        │   │
//! │  │   Registry   │  │   Launcher   │  │        Keys          │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │             Attach Server (streams + pumps)               │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  Link (serial pipes)                      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::{Agent, Config};
//! use protocol::AttachKey;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let key = AttachKey::load(&config.agent.key_file)?;
//!
//!     let agent = Agent::new(config, key)?;
//!     agent.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Sessions, registry, output relays and process launch
//! - [`server`]: Attach server
//! - [`pump`]: Output pumps and stdin sink
//! - [`link`]: Reopenable serial pipe pair and resumable connection
//! - [`liveness`]: Liveness key writer
//! - [`agent`]: Agent wiring and the serve loop

pub mod agent;
pub mod config;
pub mod link;
pub mod liveness;
pub mod pump;
pub mod server;
pub mod session;

pub use agent::{run_agent, Agent};
pub use config::{Config, ConfigError};
pub use link::{DevicePipes, Link, LinkConnection, LinkHandle, PipeOpener, QueuedPipes, REPLAY_WINDOW};
pub use liveness::{FileStore, KeyValueStore, Liveness, MemoryStore};
pub use server::{AttachServer, ServerError, ServerOptions};
pub use session::{
    CommandSpec, ProcessLauncher, Session, SessionConfig, SessionError, SessionId, SessionIo,
    SessionRegistry, SessionStatus,
};
