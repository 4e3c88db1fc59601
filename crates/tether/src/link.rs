//! Link manager: the guest's end of the serial device.
//!
//! [`Link`] owns the current pipe pair. Reconnecting opens a fresh pair,
//! swaps it in under the lock and bumps a generation counter. I/O never
//! holds on to a pipe pair directly: every call re-reads the current pair
//! and races the I/O against the next swap, so a swap unblocks anything
//! still waiting on the old pair instead of leaving it hung.
//!
//! Two transports run over a link:
//!
//! - [`LinkHandle`] is minted for one generation and fails with
//!   `ConnectionClosed` once that generation is replaced. The sync-marker
//!   handshake runs on it.
//! - [`LinkConnection`] is the byte stream higher layers speak over. It
//!   spans generations: I/O interrupted by a swap waits for the next
//!   [`Link::establish`] and carries on where it stopped.
//!
//! ## Resuming
//!
//! Each side counts the bytes it has received on the current connection
//! and keeps the last [`REPLAY_WINDOW`] bytes it has sent. After a
//! resuming handshake both sides swap their counts and replay what the
//! other missed, so the byte stream continues as if the pipes had never
//! changed:
//!
//! ```text
//! initiator                             responder
//!   RESYNC / SYN-ACK / ACK    ◄────────►
//!   received (u64 BE)         ─────────►
//!                             ◄─────────  received (u64 BE)
//!   verdict (u8)              ─────────►
//!                             ◄─────────  verdict (u8)
//!   replay                    ◄────────►  replay
//! ```
//!
//! A side with no connection to resume reports `u64::MAX`. If either
//! verdict is 0 the link starts a fresh connection and every
//! [`LinkConnection`] from before fails with `ConnectionClosed`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::{
    BoxFuture, Handshake, HandshakeOptions, PipeReader, PipeWriter, ProtocolError, Result, Role,
    Transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Sent bytes kept for replay after a resuming handshake.
pub const REPLAY_WINDOW: usize = 1 << 20;

/// Receive count reported by a side with no connection to resume.
const NOTHING_TO_RESUME: u64 = u64::MAX;

/// Opens the two one-directional pipes of the link.
pub trait PipeOpener: Send + Sync {
    /// Opens a fresh `(inbound, outbound)` pair.
    fn open(&self) -> BoxFuture<'_, std::io::Result<(PipeReader, PipeWriter)>>;
}

/// Pipes backed by a serial device or a FIFO pair on the filesystem.
///
/// The inbound path is opened before the outbound one. Both may name the
/// same character device.
#[derive(Debug, Clone)]
pub struct DevicePipes {
    read_path: PathBuf,
    write_path: PathBuf,
}

impl DevicePipes {
    /// Uses `read_path` for inbound and `write_path` for outbound bytes.
    pub fn new(read_path: impl Into<PathBuf>, write_path: impl Into<PathBuf>) -> Self {
        Self {
            read_path: read_path.into(),
            write_path: write_path.into(),
        }
    }

    /// The inbound path.
    pub fn read_path(&self) -> &Path {
        &self.read_path
    }

    /// The outbound path.
    pub fn write_path(&self) -> &Path {
        &self.write_path
    }
}

/// Pipe pairs handed over by another task, opened in arrival order.
pub struct QueuedPipes {
    pairs: tokio::sync::Mutex<mpsc::UnboundedReceiver<(PipeReader, PipeWriter)>>,
}

impl QueuedPipes {
    /// Returns the opener and the sender that feeds it.
    pub fn new() -> (Self, mpsc::UnboundedSender<(PipeReader, PipeWriter)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pairs: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

impl PipeOpener for QueuedPipes {
    fn open(&self) -> BoxFuture<'_, std::io::Result<(PipeReader, PipeWriter)>> {
        Box::pin(async move {
            self.pairs.lock().await.recv().await.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "no more pipes queued")
            })
        })
    }
}

impl PipeOpener for DevicePipes {
    fn open(&self) -> BoxFuture<'_, std::io::Result<(PipeReader, PipeWriter)>> {
        Box::pin(async move {
            let reader = tokio::fs::OpenOptions::new()
                .read(true)
                .open(&self.read_path)
                .await?;
            let writer = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.write_path)
                .await?;
            tracing::debug!(
                read_path = %self.read_path.display(),
                write_path = %self.write_path.display(),
                "Opened link pipes"
            );
            Ok((Box::new(reader) as PipeReader, Box::new(writer) as PipeWriter))
        })
    }
}

type Shared<T> = Arc<tokio::sync::Mutex<T>>;

#[derive(Clone)]
struct Pipes {
    reader: Shared<PipeReader>,
    writer: Shared<PipeWriter>,
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkState {
    /// Bumped by every pipe swap and by close.
    generation: u64,
    /// Bumped by every fresh handshake.
    epoch: u64,
    /// The current generation completed a handshake.
    ready: bool,
    /// I/O on the current generation failed.
    failed: bool,
    closed: bool,
}

/// Bytes sent on the current connection, with the tail kept for replay.
#[derive(Debug, Default)]
struct Replay {
    sent: u64,
    tail: VecDeque<u8>,
}

impl Replay {
    fn record(&mut self, data: &[u8]) {
        self.sent += data.len() as u64;
        self.tail.extend(data.iter().copied());
        let excess = self.tail.len().saturating_sub(REPLAY_WINDOW);
        self.tail.drain(..excess);
    }

    /// Everything sent after the first `offset` bytes, if still held.
    fn since(&self, offset: u64) -> Option<Vec<u8>> {
        let start = self.sent - self.tail.len() as u64;
        if offset < start || offset > self.sent {
            return None;
        }
        let skip = (offset - start) as usize;
        Some(self.tail.range(skip..).copied().collect())
    }
}

/// The current pipe pair plus its generation.
pub struct Link {
    opener: Box<dyn PipeOpener>,
    current: Mutex<Option<Pipes>>,
    state: watch::Sender<LinkState>,
    reconnecting: tokio::sync::Mutex<()>,
    replay: Arc<tokio::sync::Mutex<Replay>>,
    received: AtomicU64,
    connected: AtomicBool,
}

impl Link {
    /// Creates a link with no pipes open yet (generation 0).
    pub fn new<O: PipeOpener + 'static>(opener: O) -> Self {
        Self {
            opener: Box::new(opener),
            current: Mutex::new(None),
            state: watch::Sender::new(LinkState::default()),
            reconnecting: tokio::sync::Mutex::new(()),
            replay: Arc::new(tokio::sync::Mutex::new(Replay::default())),
            received: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pipes>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    /// Whether a pipe pair is installed.
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Whether the current pipes completed a handshake and have not failed.
    pub fn is_ready(&self) -> bool {
        let state = self.state();
        state.ready && !state.closed
    }

    /// Opens a fresh pipe pair and swaps it in.
    ///
    /// Handles minted for earlier generations fail from now on, and
    /// connections wait for the next [`establish`](Self::establish).
    /// Returns the new generation.
    pub async fn reconnect(&self) -> std::io::Result<u64> {
        let _exclusive = self.reconnecting.lock().await;

        let (reader, writer) = self.opener.open().await?;
        let mut generation = 0;
        {
            // Swap and bump under one lock so no handle sees the new pair
            // under its old generation.
            let mut current = self.lock();
            *current = Some(Pipes {
                reader: Arc::new(tokio::sync::Mutex::new(reader)),
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
            });
            self.state.send_modify(|s| {
                s.generation += 1;
                s.ready = false;
                s.failed = false;
                s.closed = false;
                generation = s.generation;
            });
        }
        tracing::info!(generation = generation, "Link pipes replaced");
        Ok(generation)
    }

    /// Drops the current pipe pair, failing all handles and connections.
    pub fn close(&self) {
        {
            let mut current = self.lock();
            current.take();
            self.state.send_modify(|s| {
                s.generation += 1;
                s.ready = false;
                s.closed = true;
            });
        }
        tracing::debug!(generation = self.generation(), "Link closed");
    }

    /// A transport bound to the current generation.
    pub fn handle(self: &Arc<Self>) -> LinkHandle {
        LinkHandle {
            link: self.clone(),
            generation: self.generation(),
            closed: CancellationToken::new(),
            established: AtomicBool::new(false),
        }
    }

    /// The byte stream for the current connection epoch.
    ///
    /// Take it after a [`Handshake::Fresh`] outcome; a later fresh
    /// handshake ends it.
    pub fn connection(self: &Arc<Self>) -> LinkConnection {
        self.connected.store(true, Ordering::SeqCst);
        LinkConnection {
            link: self.clone(),
            epoch: self.epoch(),
            closed: CancellationToken::new(),
        }
    }

    /// Runs the sync-marker handshake on the current pipes and lets
    /// connections use them.
    ///
    /// An initiator holding a live connection asks to resume it. The
    /// outcome is [`Handshake::Resumed`] only if both sides replayed;
    /// otherwise a new epoch starts and earlier connections fail.
    pub async fn establish(self: &Arc<Self>, role: Role, options: &HandshakeOptions) -> Result<Handshake> {
        let handle = self.handle();
        let generation = handle.generation();
        let connected = self.connected.load(Ordering::SeqCst);
        let options = options
            .clone()
            .resuming(role == Role::Initiator && connected);
        let outcome = handle.handshake(role, &options).await?;

        // Held until the replay is written so new output queues behind it.
        let mut replay = self.replay.clone().lock_owned().await;
        let missed = match outcome {
            Handshake::Resumed => self.resume(&handle, &replay, connected).await?,
            Handshake::Fresh => None,
        };
        let outcome = match missed {
            Some(_) => Handshake::Resumed,
            None => Handshake::Fresh,
        };

        let mut epoch = 0;
        let current = self.state.send_if_modified(|s| {
            if s.generation != generation || s.closed {
                return false;
            }
            if outcome == Handshake::Fresh {
                s.epoch += 1;
            }
            s.ready = true;
            s.failed = false;
            epoch = s.epoch;
            true
        });
        if !current {
            return Err(ProtocolError::ConnectionClosed(
                "link replaced during handshake".to_string(),
            ));
        }
        if outcome == Handshake::Fresh {
            *replay = Replay::default();
            self.received.store(0, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }
        tracing::info!(generation = generation, epoch = epoch, outcome = ?outcome, "Link established");

        match missed {
            Some(missed) if !missed.is_empty() => {
                // Replayed in the background so both sides drain each
                // other's replay concurrently.
                tokio::spawn(replay_missed(handle, missed, replay));
            }
            _ => drop(replay),
        }
        Ok(outcome)
    }

    /// Swaps receive counts with the peer. Returns the bytes to replay, or
    /// `None` if either side cannot resume.
    async fn resume(
        &self,
        handle: &LinkHandle,
        replay: &Replay,
        connected: bool,
    ) -> Result<Option<Vec<u8>>> {
        let received = if connected {
            self.received.load(Ordering::SeqCst)
        } else {
            NOTHING_TO_RESUME
        };
        handle.write_all(&received.to_be_bytes()).await?;
        let mut peer = [0u8; 8];
        read_exact(handle, &mut peer).await?;
        let peer_received = u64::from_be_bytes(peer);

        let missed = match peer_received {
            NOTHING_TO_RESUME => None,
            _ if !connected => None,
            offset => replay.since(offset),
        };
        handle.write_all(&[u8::from(missed.is_some())]).await?;
        let mut verdict = [0u8; 1];
        read_exact(handle, &mut verdict).await?;

        match missed {
            Some(missed) if verdict[0] == 1 => {
                tracing::debug!(received = received, peer_received = peer_received, replay = missed.len(), "Resuming link connection");
                Ok(Some(missed))
            }
            _ => {
                tracing::info!(received = received, peer_received = peer_received, "Link connection cannot be resumed");
                Ok(None)
            }
        }
    }

    /// Waits until I/O on the current pipes fails or the link closes.
    pub async fn failed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.failed || s.closed).await;
    }

    fn mark_failed(&self, generation: u64) {
        let marked = self.state.send_if_modified(|s| {
            if s.generation != generation || s.failed {
                return false;
            }
            s.failed = true;
            s.ready = false;
            true
        });
        if marked {
            tracing::info!(generation = generation, "Link pipes failed");
        }
    }

    fn pipes_for(&self, generation: u64) -> Result<Pipes> {
        let current = self.lock();
        if self.generation() != generation {
            return Err(ProtocolError::ConnectionClosed("link replaced".to_string()));
        }
        current
            .clone()
            .ok_or_else(|| ProtocolError::ConnectionClosed("link not open".to_string()))
    }

    async fn superseded(&self, generation: u64) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.generation != generation).await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Link")
            .field("generation", &state.generation)
            .field("epoch", &state.epoch)
            .field("ready", &state.ready)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn replay_missed(handle: LinkHandle, missed: Vec<u8>, replay: OwnedMutexGuard<Replay>) {
    if let Err(e) = handle.write_all(&missed).await {
        tracing::debug!(generation = handle.generation, error = %e, "Replay interrupted");
        handle.link.mark_failed(handle.generation);
    }
    drop(replay);
}

async fn read_exact(transport: &dyn Transport, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match transport.read(&mut buf[filled..]).await? {
            0 => return Err(ProtocolError::TransportClosedByPeer),
            n => filled += n,
        }
    }
    Ok(())
}

/// [`Transport`] over one generation of a [`Link`].
pub struct LinkHandle {
    link: Arc<Link>,
    generation: u64,
    closed: CancellationToken,
    established: AtomicBool,
}

impl LinkHandle {
    /// The generation this handle was minted for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the link moved on since this handle was minted.
    pub fn is_stale(&self) -> bool {
        self.link.generation() != self.generation
    }

    fn interrupted(&self, what: &str) -> ProtocolError {
        if self.closed.is_cancelled() {
            ProtocolError::ConnectionClosed("connection closed locally".to_string())
        } else {
            ProtocolError::ConnectionClosed(format!("link replaced during {}", what))
        }
    }
}

impl Transport for LinkHandle {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let pipes = self.link.pipes_for(self.generation)?;
            tokio::select! {
                res = async {
                    let mut reader = pipes.reader.lock().await;
                    reader.read(buf).await
                } => Ok(res?),
                _ = self.link.superseded(self.generation) => Err(self.interrupted("read")),
                _ = self.closed.cancelled() => Err(self.interrupted("read")),
            }
        })
    }

    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let pipes = self.link.pipes_for(self.generation)?;
            tokio::select! {
                res = async {
                    let mut writer = pipes.writer.lock().await;
                    writer.write_all(data).await?;
                    writer.flush().await
                } => Ok(res?),
                _ = self.link.superseded(self.generation) => Err(self.interrupted("write")),
                _ = self.closed.cancelled() => Err(self.interrupted("write")),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.cancel();
            self.established.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst) && !self.is_stale()
    }

    fn set_established(&self, established: bool) {
        self.established.store(established, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("generation", &self.generation)
            .field("stale", &self.is_stale())
            .finish()
    }
}

/// One connection's byte stream over a [`Link`], surviving pipe swaps.
///
/// Reads and writes re-acquire the current pipes on every call. While the
/// pipes are down they wait for [`Link::establish`]; a write cut short by
/// a swap is covered by the replay. Only a new epoch, a closed link or
/// [`Transport::close`] ends the connection.
pub struct LinkConnection {
    link: Arc<Link>,
    epoch: u64,
    closed: CancellationToken,
}

impl LinkConnection {
    /// The epoch this connection belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Waits until the link is usable for this connection and returns the
    /// generation to use.
    async fn ready(&self) -> Result<u64> {
        let mut rx = self.link.state.subscribe();
        let state = tokio::select! {
            state = rx.wait_for(|s| s.closed || s.epoch != self.epoch || s.ready) => state
                .map(|s| *s)
                .map_err(|_| ProtocolError::ConnectionClosed("link dropped".to_string()))?,
            _ = self.closed.cancelled() => return Err(closed_locally()),
        };

        if state.closed {
            Err(ProtocolError::ConnectionClosed("link closed".to_string()))
        } else if state.epoch != self.epoch {
            Err(ProtocolError::ConnectionClosed(
                "peer started a new connection".to_string(),
            ))
        } else {
            Ok(state.generation)
        }
    }

    fn usable(&self, generation: u64) -> bool {
        let state = self.link.state();
        state.ready && !state.closed && state.epoch == self.epoch && state.generation == generation
    }
}

fn closed_locally() -> ProtocolError {
    ProtocolError::ConnectionClosed("connection closed locally".to_string())
}

impl Transport for LinkConnection {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            if buf.is_empty() {
                return Ok(0);
            }
            loop {
                let generation = self.ready().await?;
                let Ok(pipes) = self.link.pipes_for(generation) else {
                    continue;
                };

                let outcome = tokio::select! {
                    res = async {
                        let mut reader = pipes.reader.lock().await;
                        let n = reader.read(&mut buf[..]).await?;
                        self.link.received.fetch_add(n as u64, Ordering::SeqCst);
                        Ok::<_, std::io::Error>(n)
                    } => Some(res),
                    _ = self.link.superseded(generation) => None,
                    _ = self.closed.cancelled() => return Err(closed_locally()),
                };
                match outcome {
                    Some(Ok(0)) => {
                        tracing::debug!(generation = generation, "Link pipes reached end-of-stream");
                        self.link.mark_failed(generation);
                    }
                    Some(Ok(n)) => return Ok(n),
                    Some(Err(e)) => {
                        tracing::debug!(generation = generation, error = %e, "Link read failed");
                        self.link.mark_failed(generation);
                    }
                    None => {}
                }
            }
        })
    }

    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            loop {
                let generation = self.ready().await?;
                let mut replay = self.link.replay.lock().await;
                let Ok(pipes) = self.link.pipes_for(generation) else {
                    continue;
                };
                if !self.usable(generation) {
                    continue;
                }

                replay.record(data);
                let written = tokio::select! {
                    res = async {
                        let mut writer = pipes.writer.lock().await;
                        writer.write_all(data).await?;
                        writer.flush().await
                    } => res,
                    // Already recorded: the next resume replays it.
                    _ = self.link.superseded(generation) => Ok(()),
                    _ = self.closed.cancelled() => return Err(closed_locally()),
                };
                if let Err(e) = written {
                    tracing::debug!(generation = generation, error = %e, "Link write failed");
                    self.link.mark_failed(generation);
                }
                return Ok(());
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.cancel();
            if self.link.epoch() == self.epoch {
                self.link.connected.store(false, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn is_established(&self) -> bool {
        !self.closed.is_cancelled() && self.usable(self.link.generation())
    }

    /// Readiness belongs to the link; see [`Link::establish`].
    fn set_established(&self, _established: bool) {}

    /// Re-establishes the link. A fresh outcome ends this connection.
    fn handshake<'a>(
        &'a self,
        role: Role,
        options: &'a HandshakeOptions,
    ) -> BoxFuture<'a, Result<Handshake>> {
        Box::pin(self.link.establish(role, options))
    }
}

impl std::fmt::Debug for LinkConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConnection")
            .field("epoch", &self.epoch)
            .field("established", &self.is_established())
            .finish()
    }
}
