//! Agent wiring.
//!
//! [`Agent`] builds the registry, attach server, launcher and link from a
//! [`Config`], starts the configured sessions and then runs
//! [`run_agent`]: the responder side of the link handshake, one served
//! client at a time, and a fresh pipe pair whenever the current one fails.

use std::sync::Arc;

use anyhow::Result;
use protocol::{AttachKey, Handshake, ProtocolError, Role, Transport};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, TransportConfig};
use crate::link::{DevicePipes, Link, LinkConnection};
use crate::liveness::{FileStore, Liveness};
use crate::server::{AttachServer, ServerError};
use crate::session::{ProcessLauncher, Session, SessionRegistry};

/// The guest agent.
pub struct Agent {
    config: Config,
    registry: Arc<SessionRegistry>,
    server: Arc<AttachServer>,
    launcher: ProcessLauncher,
    link: Arc<Link>,
    liveness: Option<Liveness>,
    shutdown: CancellationToken,
}

impl Agent {
    /// Builds an agent talking over the configured device paths.
    pub fn new(config: Config, key: AttachKey) -> Result<Self> {
        let pipes = DevicePipes::new(&config.transport.read_path, &config.transport.write_path);
        Self::with_link(config, key, Arc::new(Link::new(pipes)))
    }

    /// Builds an agent over an existing link.
    pub fn with_link(config: Config, key: AttachKey, link: Arc<Link>) -> Result<Self> {
        let liveness = config.liveness.enabled.then(|| {
            Liveness::new(
                Arc::new(FileStore::new(&config.liveness.store_path)),
                config.liveness.prefix.clone(),
            )
        });
        let registry = Arc::new(match &liveness {
            Some(liveness) => SessionRegistry::with_liveness(liveness.clone()),
            None => SessionRegistry::new(),
        });

        for entry in &config.sessions {
            registry.register(Session::new(
                entry.session_config(),
                config.attach.max_buffered_bytes,
            ))?;
        }

        let server = Arc::new(AttachServer::new(
            registry.clone(),
            key,
            config.attach.server_options(),
        ));

        Ok(Self {
            launcher: ProcessLauncher::new(registry.clone()),
            config,
            registry,
            server,
            link,
            liveness,
            shutdown: CancellationToken::new(),
        })
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The attach server.
    pub fn server(&self) -> &Arc<AttachServer> {
        &self.server
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts every configured session's process.
    pub fn launch_sessions(&self) -> Vec<JoinHandle<()>> {
        self.config
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = self.registry.get(&entry.id)?;
                Some(self.launcher.launch(session, entry.command_spec()))
            })
            .collect()
    }

    /// Launches sessions and serves clients until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(sessions = self.registry.len(), "Tether agent starting");
        let launched = self.launch_sessions();

        if let Some(liveness) = &self.liveness {
            liveness.component_started(&self.config.liveness.component);
            if let Some(address) = &self.config.liveness.client_address {
                liveness.client_address(address);
            }
        }

        run_agent(
            self.link.clone(),
            self.server.clone(),
            &self.config.transport,
            self.shutdown.clone(),
        )
        .await;

        for task in launched {
            task.abort();
        }
        info!("Tether agent stopped");
        Ok(())
    }

    /// Requests shutdown.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Serves clients over `link` until `shutdown` fires.
///
/// The attach server runs on a [`LinkConnection`], which outlives pipe
/// swaps. When the pipes fail the agent reopens them and answers the next
/// handshake: a resuming peer carries on with every stream intact, a fresh
/// one ends the old connection (detaching its streams) and is served on a
/// new one.
pub async fn run_agent(
    link: Arc<Link>,
    server: Arc<AttachServer>,
    transport: &TransportConfig,
    shutdown: CancellationToken,
) {
    let mut serving: Option<Serving> = None;
    let mut reopen = !link.is_open();

    while !shutdown.is_cancelled() {
        if reopen {
            let reopened = tokio::select! {
                result = link.reconnect() => result,
                _ = shutdown.cancelled() => break,
            };
            if let Err(e) = reopened {
                warn!(error = %e, "Failed to open link pipes");
                if pause(transport, &shutdown).await {
                    break;
                }
                continue;
            }
        }

        let options = transport.handshake_options(shutdown.clone());
        match link.establish(Role::Responder, &options).await {
            Ok(Handshake::Resumed) => info!(generation = link.generation(), "Link resumed"),
            Ok(Handshake::Fresh) => {
                if let Some(previous) = serving.take() {
                    previous.stop().await;
                }
                serving = Some(Serving::start(&link, &server));
            }
            Err(ProtocolError::TransportHandshakeTimeout(_)) if shutdown.is_cancelled() => break,
            Err(ProtocolError::TransportClosedByPeer) => {
                info!(generation = link.generation(), "Peer closed the link, reopening");
                reopen = true;
                continue;
            }
            Err(e) => {
                warn!(generation = link.generation(), error = %e, "Link handshake failed");
                reopen = true;
                if pause(transport, &shutdown).await {
                    break;
                }
                continue;
            }
        }

        let ended = tokio::select! {
            _ = link.failed() => None,
            ended = served(&mut serving) => Some(ended),
            _ = shutdown.cancelled() => break,
        };
        match ended {
            Some(ended) => {
                serving = None;
                report(ended);
            }
            None => debug!(generation = link.generation(), "Link pipes failed, reopening"),
        }
        reopen = true;
    }

    if let Some(serving) = serving {
        serving.stop().await;
    }
}

/// The attach server running on one link connection.
struct Serving {
    connection: Arc<LinkConnection>,
    task: JoinHandle<std::result::Result<(), ServerError>>,
}

impl Serving {
    fn start(link: &Arc<Link>, server: &Arc<AttachServer>) -> Self {
        let connection = Arc::new(link.connection());
        info!(epoch = connection.epoch(), "Serving new link connection");
        let task = {
            let server = server.clone();
            let transport: Arc<dyn Transport> = connection.clone();
            tokio::spawn(async move { server.serve_connection(transport).await })
        };
        Self { connection, task }
    }

    /// Closes the connection and waits for the server to let go of it.
    async fn stop(self) {
        let _ = self.connection.close().await;
        report(self.task.await);
    }
}

async fn served(
    serving: &mut Option<Serving>,
) -> std::result::Result<std::result::Result<(), ServerError>, JoinError> {
    match serving {
        Some(serving) => (&mut serving.task).await,
        None => std::future::pending().await,
    }
}

fn report(ended: std::result::Result<std::result::Result<(), ServerError>, JoinError>) {
    match ended {
        Ok(Ok(())) => debug!("Client session ended"),
        Ok(Err(e)) if e.is_link_error() => debug!(error = %e, "Client link dropped"),
        Ok(Err(e)) => warn!(error = %e, "Client session failed"),
        Err(e) => warn!(error = %e, "Attach server task failed"),
    }
}

/// Waits out the reconnect delay. Returns true if shutdown fired instead.
async fn pause(transport: &TransportConfig, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(transport.reconnect_delay()) => false,
        _ = shutdown.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionEntry;
    use crate::link::tests::MemoryPipes;
    use crate::liveness::KeyValueStore;
    use protocol::messages::{ListSessions, SessionList};
    use protocol::{HalfDuplexConn, HandshakeOptions, Message, SecureChannel};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(id: &str, command: &str) -> SessionEntry {
        SessionEntry {
            id: id.to_string(),
            name: None,
            command: command.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            tty: false,
            attachable: true,
            run_block: true,
            cols: 80,
            rows: 24,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.transport.handshake_interval_ms = 20;
        config.transport.reconnect_delay_ms = 20;
        config.sessions = vec![entry("alpha", "/bin/cat"), entry("beta", "/bin/cat")];
        config
    }

    fn fast() -> HandshakeOptions {
        HandshakeOptions::default()
            .with_interval(Duration::from_millis(20))
            .with_deadline(Duration::from_secs(5))
    }

    async fn list(host: HalfDuplexConn, key: &AttachKey) -> (Arc<dyn Transport>, Vec<String>) {
        host.handshake(Role::Initiator, &fast()).await.unwrap();
        let host: Arc<dyn Transport> = Arc::new(host);
        let channel = SecureChannel::initiate(host.clone(), key).await.unwrap();
        channel
            .send(Message::ListSessions(ListSessions { request_id: 1 }))
            .await
            .unwrap();
        match channel.recv().await.unwrap() {
            Message::SessionList(SessionList { session_ids, .. }) => (host, session_ids),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registers_configured_sessions() {
        let (opener, _peers) = MemoryPipes::new();
        let link = Arc::new(Link::new(opener));
        let agent = Agent::with_link(test_config(), AttachKey::generate(), link).unwrap();
        assert_eq!(agent.registry().ids(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let mut config = test_config();
        config.sessions.push(entry("alpha", "/bin/true"));
        let (opener, _peers) = MemoryPipes::new();
        let link = Arc::new(Link::new(opener));
        assert!(Agent::with_link(config, AttachKey::generate(), link).is_err());
    }

    #[tokio::test]
    async fn test_serves_again_after_client_disconnects() {
        let key = AttachKey::generate();
        let (opener, mut peers) = MemoryPipes::new();
        let link = Arc::new(Link::new(opener));
        let agent = Arc::new(Agent::with_link(test_config(), key.clone(), link).unwrap());
        let running = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };

        let first = peers.recv().await.unwrap();
        let (first, ids) = list(first, &key).await;
        assert_eq!(ids, vec!["alpha", "beta"]);
        first.close().await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), peers.recv())
            .await
            .unwrap()
            .unwrap();
        let (_second, ids) = list(second, &key).await;
        assert_eq!(ids.len(), 2);

        agent.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_handshake() {
        let (opener, _peers) = MemoryPipes::new();
        let link = Arc::new(Link::new(opener));
        let agent = Arc::new(Agent::with_link(test_config(), AttachKey::generate(), link).unwrap());
        let running = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_liveness_component_key_written() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.liveness.enabled = true;
        config.liveness.store_path = dir.path().join("liveness.json");
        config.liveness.client_address = Some("172.16.0.2".to_string());

        let (opener, _peers) = MemoryPipes::new();
        let link = Arc::new(Link::new(opener));
        let agent = Arc::new(Agent::with_link(config, AttachKey::generate(), link).unwrap());
        let running = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.stop();
        running.await.unwrap().unwrap();

        let store = FileStore::new(dir.path().join("liveness.json"));
        assert!(store
            .get("guestinfo.vice..init|port-layer.started")
            .unwrap()
            .is_some());
        assert_eq!(
            store
                .get("guestinfo.vice..init.networks|client.assigned.IP")
                .unwrap()
                .as_deref(),
            Some("172.16.0.2")
        );
        assert_eq!(
            store
                .get("guestinfo.vice..init.sessions|alpha.status")
                .unwrap()
                .as_deref(),
            Some("pending")
        );
    }
}
