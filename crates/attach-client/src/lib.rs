//! # Tether Attach Client
//!
//! Host side of the guest attach protocol: authenticates to a guest's
//! attach server over an established [`Transport`](protocol::Transport),
//! lists its sessions and attaches to them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use attach_client::AttachClient;
//! use protocol::{AttachKey, HalfDuplexConn, HandshakeOptions, Role, Transport};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn demo(conn: HalfDuplexConn, key: AttachKey) -> anyhow::Result<()> {
//! conn.handshake(Role::Initiator, &HandshakeOptions::default()).await?;
//! let client = AttachClient::connect(Arc::new(conn), &key).await?;
//!
//! let mut attached = client.attach("web").await?;
//! attached.stdin.write_all(b"uptime\n").await?;
//! attached.stdin.shutdown().await?; // detach
//! attached.control.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod stream;

pub use client::AttachClient;
pub use error::ClientError;
pub use stream::{AttachStdin, Attached, ControlHandle, OutputReader, StreamEnd};
