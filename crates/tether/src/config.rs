//! Configuration management for the tether agent.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`; inside
//! a guest the agent is normally started with an explicit `--config`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::HandshakeOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::liveness::DEFAULT_PREFIX;
use crate::server::{ServerOptions, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_STDIN_CAPACITY};
use crate::session::process::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::session::{CommandSpec, SessionConfig};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("transport paths must not be empty")]
    EmptyTransportPath,

    #[error("handshake_interval_ms must be between 10 and 60000, got {0}")]
    InvalidHandshakeInterval(u64),

    #[error("max_buffered_bytes must be greater than 0")]
    InvalidBufferLimit,

    #[error("queue capacities must be greater than 0")]
    InvalidQueueCapacity,

    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("duplicate session id: {0}")]
    DuplicateSession(String),

    #[error("session {0} has no command")]
    EmptyCommand(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the tether agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General agent configuration.
    pub agent: AgentConfig,

    /// Serial link configuration.
    pub transport: TransportConfig,

    /// Attach server configuration.
    pub attach: AttachConfig,

    /// Liveness key configuration.
    pub liveness: LivenessConfig,

    /// Sessions to register and launch at startup.
    pub sessions: Vec<SessionEntry>,
}

/// General agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rotated log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,

    /// File holding the hex-encoded attach key.
    pub key_file: PathBuf,
}

/// Serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Inbound pipe (host → guest).
    pub read_path: PathBuf,

    /// Outbound pipe (guest → host).
    pub write_path: PathBuf,

    /// Spacing between handshake attempts, in milliseconds.
    pub handshake_interval_ms: u64,

    /// Pause before reopening the pipes after a failure, in milliseconds.
    pub reconnect_delay_ms: u64,
}

/// Attach server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttachConfig {
    /// Output retained per stream direction while a session is detached.
    pub max_buffered_bytes: usize,

    /// Outbound messages queued per connection.
    pub outbound_queue: usize,

    /// Input chunks queued per stream. A stream whose process stops
    /// reading overflows the queue and is detached.
    pub stdin_queue: usize,
}

/// Liveness key configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    /// Whether liveness keys are written.
    pub enabled: bool,

    /// JSON file the keys are written to.
    pub store_path: PathBuf,

    /// Key prefix.
    pub prefix: String,

    /// Component name announced at startup.
    pub component: String,

    /// Address published for the host-side client, if any.
    pub client_address: Option<String>,
}

/// A session to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntry {
    /// Unique session id.
    pub id: String,

    /// Human label; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Program to run.
    pub command: String,

    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Run on a pseudo-terminal.
    #[serde(default)]
    pub tty: bool,

    /// Allow clients to attach.
    #[serde(default = "default_true")]
    pub attachable: bool,

    /// Hold the process until a client attaches.
    #[serde(default)]
    pub run_block: bool,

    /// Initial terminal width.
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Initial terminal height.
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_true() -> bool {
    true
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            key_file: default_data_dir().join("attach.key"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_path: PathBuf::from("/dev/ttyS1"),
            write_path: PathBuf::from("/dev/ttyS1"),
            handshake_interval_ms: 1000,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 1024 * 1024,
            outbound_queue: DEFAULT_OUTBOUND_CAPACITY,
            stdin_queue: DEFAULT_STDIN_CAPACITY,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_path: default_data_dir().join("liveness.json"),
            prefix: DEFAULT_PREFIX.to_string(),
            component: "port-layer".to_string(),
            client_address: None,
        }
    }
}

impl TransportConfig {
    /// Handshake settings honouring `cancel`.
    pub fn handshake_options(&self, cancel: CancellationToken) -> HandshakeOptions {
        HandshakeOptions::default()
            .with_interval(Duration::from_millis(self.handshake_interval_ms))
            .with_cancel(cancel)
    }

    /// Pause before reopening the pipes.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl AttachConfig {
    /// Server tuning derived from this section.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            outbound_capacity: self.outbound_queue,
            stdin_capacity: self.stdin_queue,
        }
    }
}

impl SessionEntry {
    /// Registry attributes for this session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            tty: self.tty,
            attachable: self.attachable,
            run_block: self.run_block,
        }
    }

    /// What the launcher runs.
    pub fn command_spec(&self) -> CommandSpec {
        CommandSpec {
            program: self.command.clone(),
            args: self.args.clone(),
            env: self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cwd: self.cwd.clone(),
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_LOG_LEVEL: Override log level
    /// - TETHER_KEY_FILE: Override the attach key file
    /// - TETHER_READ_PATH / TETHER_WRITE_PATH: Override the link pipes
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("TETHER_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.agent.log_level = level;
        }

        if let Some(path) = non_empty_env("TETHER_KEY_FILE") {
            tracing::info!("Overriding key_file from environment: {}", path);
            self.agent.key_file = PathBuf::from(path);
        }

        if let Some(path) = non_empty_env("TETHER_READ_PATH") {
            tracing::info!("Overriding read_path from environment: {}", path);
            self.transport.read_path = PathBuf::from(path);
        }

        if let Some(path) = non_empty_env("TETHER_WRITE_PATH") {
            tracing::info!("Overriding write_path from environment: {}", path);
            self.transport.write_path = PathBuf::from(path);
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.agent.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.agent.log_level.clone()));
        }

        if self.transport.read_path.as_os_str().is_empty()
            || self.transport.write_path.as_os_str().is_empty()
        {
            return Err(ConfigError::EmptyTransportPath);
        }

        let interval = self.transport.handshake_interval_ms;
        if !(10..=60_000).contains(&interval) {
            return Err(ConfigError::InvalidHandshakeInterval(interval));
        }

        if self.attach.max_buffered_bytes == 0 {
            return Err(ConfigError::InvalidBufferLimit);
        }

        if self.attach.outbound_queue == 0 || self.attach.stdin_queue == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }

        let mut seen = HashSet::new();
        for entry in &self.sessions {
            if entry.id.is_empty() {
                return Err(ConfigError::EmptySessionId);
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::DuplicateSession(entry.id.clone()));
            }
            if entry.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(entry.id.clone()));
            }
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[agent]
log_level = "debug"
key_file = "/etc/tether/attach.key"

[transport]
read_path = "/tmp/ttyS0c"
write_path = "/tmp/ttyS0s"
handshake_interval_ms = 250

[attach]
max_buffered_bytes = 4096

[liveness]
enabled = true
store_path = "/run/tether/liveness.json"

[[sessions]]
id = "web"
command = "/usr/bin/nginx"
args = ["-g", "daemon off;"]

[[sessions]]
id = "shell"
name = "Debug shell"
command = "/bin/sh"
tty = true
run_block = true
env = { TERM = "xterm" }
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agent.log_level, "info");
        assert_eq!(config.transport.handshake_interval_ms, 1000);
        assert_eq!(config.attach.max_buffered_bytes, 1024 * 1024);
        assert!(!config.liveness.enabled);
        assert_eq!(config.liveness.prefix, DEFAULT_PREFIX);
        assert!(config.sessions.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_full() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.agent.log_level, "debug");
        assert_eq!(config.transport.read_path, PathBuf::from("/tmp/ttyS0c"));
        assert_eq!(config.transport.write_path, PathBuf::from("/tmp/ttyS0s"));
        assert_eq!(config.attach.max_buffered_bytes, 4096);
        assert!(config.liveness.enabled);
        assert_eq!(config.sessions.len(), 2);

        let web = &config.sessions[0];
        assert!(web.attachable);
        assert!(!web.tty);
        assert_eq!(web.session_config().name, "web");
        assert_eq!(web.command_spec().args, vec!["-g", "daemon off;"]);

        let shell = &config.sessions[1];
        assert!(shell.tty);
        assert!(shell.run_block);
        assert_eq!(shell.session_config().name, "Debug shell");
        assert_eq!(
            shell.command_spec().env,
            vec![("TERM".to_string(), "xterm".to_string())]
        );
        assert_eq!(shell.cols, DEFAULT_COLS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[agent").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[attach]\nmax_buffered_bytes = \"lots\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("config.toml");

        let config = Config::from_toml(SAMPLE).unwrap();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("tether/config.toml"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.agent.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_validate_handshake_interval_bounds() {
        let mut config = Config::default();
        config.transport.handshake_interval_ms = 5;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHandshakeInterval(5)));
        config.transport.handshake_interval_ms = 10;
        assert!(config.validate().is_ok());
        config.transport.handshake_interval_ms = 60_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHandshakeInterval(60_001))
        );
    }

    #[test]
    fn test_validate_zero_buffer() {
        let mut config = Config::default();
        config.attach.max_buffered_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBufferLimit));
    }

    #[test]
    fn test_validate_duplicate_session() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        let mut dup = config.sessions[0].clone();
        dup.command = "/bin/true".to_string();
        config.sessions.push(dup);
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateSession("web".to_string()))
        );
    }

    #[test]
    fn test_validate_empty_command() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.sessions[0].command = "  ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyCommand("web".to_string()))
        );
    }

    #[test]
    fn test_server_options_follow_config() {
        let mut config = Config::default();
        config.attach.outbound_queue = 8;
        config.attach.stdin_queue = 2;
        let options = config.attach.server_options();
        assert_eq!(options.outbound_capacity, 8);
        assert_eq!(options.stdin_capacity, 2);
    }

    #[test]
    #[serial]
    fn test_env_override_paths() {
        std::env::set_var("TETHER_READ_PATH", "/tmp/in");
        std::env::set_var("TETHER_WRITE_PATH", "/tmp/out");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.transport.read_path, PathBuf::from("/tmp/in"));
        assert_eq!(config.transport.write_path, PathBuf::from("/tmp/out"));

        std::env::remove_var("TETHER_READ_PATH");
        std::env::remove_var("TETHER_WRITE_PATH");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TETHER_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.agent.log_level, "info");

        std::env::remove_var("TETHER_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level_and_key() {
        std::env::set_var("TETHER_LOG_LEVEL", "trace");
        std::env::set_var("TETHER_KEY_FILE", "/run/secrets/attach.key");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.agent.log_level, "trace");
        assert_eq!(config.agent.key_file, PathBuf::from("/run/secrets/attach.key"));

        std::env::remove_var("TETHER_LOG_LEVEL");
        std::env::remove_var("TETHER_KEY_FILE");
    }
}
