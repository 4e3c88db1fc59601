//! Tether Attach
//!
//! Lists and attaches to sessions inside a guest over its serial link.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use attach_client::{AttachClient, ClientError, StreamEnd};
use clap::{Parser, Subcommand};
use protocol::{AttachKey, HalfDuplexConn, HandshakeOptions, Role, Transport};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Tether Attach - connect to sessions inside a guest.
#[derive(Parser, Debug)]
#[command(name = "tether-attach")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Pipe carrying guest output to the host
    #[arg(long, global = true, value_name = "PATH", default_value = "/var/run/tether/ttyS1s")]
    pub read_path: PathBuf,

    /// Pipe carrying host input to the guest
    #[arg(long, global = true, value_name = "PATH", default_value = "/var/run/tether/ttyS1c")]
    pub write_path: PathBuf,

    /// Attach key file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// Give up if the guest does not answer within this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List session ids
    Ls,

    /// Attach to a session
    Attach {
        /// Session id
        id: String,

        /// Replay buffered output only, also for exited sessions
        #[arg(long)]
        logs: bool,

        /// Initial terminal size as COLSxROWS
        #[arg(long, value_parser = parse_size)]
        size: Option<(u16, u16)>,
    },

    /// Send a signal to a session
    Kill {
        /// Session id
        id: String,

        /// Signal name or number
        #[arg(long, short, default_value = "TERM")]
        signal: String,
    },

    /// Check the attach server is responsive
    Ping,
}

fn parse_size(value: &str) -> Result<(u16, u16), String> {
    let (cols, rows) = value
        .split_once('x')
        .ok_or_else(|| format!("expected COLSxROWS, got {}", value))?;
    let cols = cols.parse().map_err(|_| format!("invalid columns: {}", cols))?;
    let rows = rows.parse().map_err(|_| format!("invalid rows: {}", rows))?;
    Ok((cols, rows))
}

fn default_key_path() -> PathBuf {
    std::env::var_os("TETHER_KEY_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("attach.key"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<ClientError>()
                .map(ClientError::exit_code)
                .unwrap_or(attach_client::error::GENERIC_EXIT_STATUS)
        }
    };
    // Exit directly: a pending blocking read on local stdin would otherwise
    // hold up runtime shutdown.
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let key_path = cli.key.clone().unwrap_or_else(default_key_path);
    let key = AttachKey::load(&key_path)
        .with_context(|| format!("Failed to load attach key from {}", key_path.display()))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let transport = open_link(&cli, cancel).await?;
    let client = AttachClient::connect(transport, &key).await?;

    let code = match cli.command {
        Commands::Ls => {
            for id in client.list().await? {
                println!("{}", id);
            }
            0
        }
        Commands::Ping => {
            client.ping().await?;
            println!("ok");
            0
        }
        Commands::Kill { id, signal } => {
            let attached = client.attach(&id).await?;
            attached.control.signal(&signal).await?;
            attached.control.detach().await?;
            0
        }
        Commands::Attach { id, logs, size } => attach(&client, &id, logs, size).await?,
    };

    client.close().await?;
    Ok(code)
}

/// Opens the pipes and runs the link handshake.
///
/// The write side is opened first; the guest opens its read side first,
/// so a FIFO pair never deadlocks.
async fn open_link(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<Arc<dyn Transport>> {
    let writer = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&cli.write_path)
        .await
        .with_context(|| format!("Failed to open {}", cli.write_path.display()))?;
    let reader = tokio::fs::File::open(&cli.read_path)
        .await
        .with_context(|| format!("Failed to open {}", cli.read_path.display()))?;

    let conn = HalfDuplexConn::new(reader, writer);
    let mut options = HandshakeOptions::default().with_cancel(cancel);
    if let Some(secs) = cli.timeout {
        options = options.with_deadline(Duration::from_secs(secs));
    }
    conn.handshake(Role::Initiator, &options)
        .await
        .context("Guest did not answer the link handshake")?;
    Ok(Arc::new(conn))
}

async fn attach(
    client: &AttachClient,
    id: &str,
    logs: bool,
    size: Option<(u16, u16)>,
) -> anyhow::Result<i32> {
    let attached = if logs {
        client.attach_logs(id).await?
    } else {
        client.attach(id).await?
    };
    let attach_client::Attached {
        mut stdin,
        mut stdout,
        mut stderr,
        control,
    } = attached;

    if let (Some((cols, rows)), true) = (size, control.is_tty()) {
        control.resize(cols, rows).await?;
    }

    let input = async {
        if logs {
            return;
        }
        let mut local = tokio::io::stdin();
        if let Err(e) = tokio::io::copy(&mut local, &mut stdin).await {
            tracing::debug!(error = %e, "Input copy ended");
        }
        // Local end-of-input detaches.
        let _ = stdin.shutdown().await;
    };
    let output = async {
        let mut local = tokio::io::stdout();
        let _ = tokio::io::copy(&mut stdout, &mut local).await;
        let _ = local.flush().await;
    };
    let errors = async {
        let mut local = tokio::io::stderr();
        let _ = tokio::io::copy(&mut stderr, &mut local).await;
        let _ = local.flush().await;
    };

    let (end, ()) = tokio::join!(
        async {
            tokio::select! {
                end = control.wait() => end,
                _ = input => control.wait().await,
            }
        },
        async {
            tokio::join!(output, errors);
        }
    );

    Ok(match end? {
        StreamEnd::Detached => 0,
        StreamEnd::Exited(Some(code)) => code,
        StreamEnd::Exited(None) => attach_client::error::GENERIC_EXIT_STATUS,
    })
}
