//! Tether Guest Agent
//!
//! Serves attach clients over the guest's serial link.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::AttachKey;
use tether::config::{AgentConfig, Config};
use tether::Agent;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Tether - attach to processes inside an isolated guest.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the agent.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the configured sessions and serve attach clients
    Run,

    /// Generate a new attach key
    Keygen {
        /// Where to write the key (defaults to the configured key file)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Print the fingerprint of the configured attach key
    Fingerprint,

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_logging(&config.agent, cli.verbose);
    if let Some(config_path) = &cli.config {
        tracing::info!(path = %config_path.display(), "Using config file");
    }

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Keygen { output, force } => {
            let path = output.unwrap_or_else(|| config.agent.key_file.clone());
            if path.exists() && !force {
                anyhow::bail!(
                    "Key file {} already exists; pass --force to replace it",
                    path.display()
                );
            }
            let key = AttachKey::generate();
            key.save(&path)
                .with_context(|| format!("Failed to write key file {}", path.display()))?;
            println!("Wrote attach key to {}", path.display());
            println!("Fingerprint: {}", key.fingerprint());
        }
        Commands::Fingerprint => {
            let key = load_key(&config)?;
            println!("{}", key.fingerprint());
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let key = load_key(&config)?;
    tracing::info!(
        read_path = %config.transport.read_path.display(),
        write_path = %config.transport.write_path.display(),
        key = %key.fingerprint(),
        "Starting tether agent"
    );

    let agent = Agent::new(config, key)?;
    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.cancel();
    });

    agent.run().await
}

fn load_key(config: &Config) -> anyhow::Result<AttachKey> {
    AttachKey::load(&config.agent.key_file).with_context(|| {
        format!(
            "Failed to load attach key from {}",
            config.agent.key_file.display()
        )
    })
}

/// Installs the global subscriber. Keep the returned guard alive so the
/// file writer flushes on exit.
fn init_logging(agent: &AgentConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { agent.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &agent.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tether.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Failed to register signal handlers, using ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_keygen() {
        let cli = Cli::parse_from(["tether", "keygen", "--output", "/tmp/k", "--force"]);
        match cli.command {
            Commands::Keygen { output, force } => {
                assert_eq!(output, Some(PathBuf::from("/tmp/k")));
                assert!(force);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["tether", "run", "-c", "/etc/tether.toml", "-v"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tether.toml")));
        assert!(cli.verbose);
    }
}
