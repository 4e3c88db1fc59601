//! Half-duplex framed transport.
//!
//! The guest and host each see two one-directional byte pipes (the two ends
//! of an emulated serial device, or a FIFO pair). [`HalfDuplexConn`] joins
//! one inbound and one outbound pipe into a single duplex connection, and
//! the [`Transport`] handshake proves both ends are live before any higher
//! layer speaks.
//!
//! ## Sync markers
//!
//! ```text
//! initiator                      responder
//!     SYN(s)       ─────────►
//!                  ◄─────────    SYN-ACK(s+1)
//!     ACK(s+2)     ─────────►
//! ```
//!
//! Each marker is `[0xA7, flag, seq(u32 BE)]`. The initiator resends SYN
//! with a fresh sequence number on a fixed interval until it sees the
//! matching SYN-ACK. Markers with an unexpected flag or sequence number are
//! stale leftovers from earlier attempts and are skipped. End-of-stream at
//! any point means the peer closed its end on purpose and is never retried.
//!
//! An initiator that wants to carry on an earlier connection over fresh
//! pipes sends RESYNC (flag 4) in place of SYN. Both sides then report
//! [`Handshake::Resumed`]; what resuming means is up to the transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::noise::Role;

/// First byte of every sync marker.
pub const SYNC_MAGIC: u8 = 0xA7;

/// Encoded marker length: magic + flag + u32 sequence.
pub const MARKER_LEN: usize = 6;

/// Default spacing between initiator attempts.
pub const DEFAULT_HANDSHAKE_INTERVAL: Duration = Duration::from_secs(1);

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed inbound pipe.
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound pipe.
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A reliable, ordered byte connection with a liveness handshake.
///
/// Implementations are interchangeable: the in-guest link manager, a plain
/// pipe pair and in-memory test doubles all satisfy the same contract.
pub trait Transport: Send + Sync {
    /// Reads available bytes into `buf`. Returns `Ok(0)` at end-of-stream.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>>;

    /// Writes all of `data`.
    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Closes both directions and unblocks pending I/O.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Whether the last handshake succeeded and nothing has failed since.
    fn is_established(&self) -> bool;

    /// Records the outcome of a handshake.
    fn set_established(&self, established: bool);

    /// Runs the sync-marker handshake.
    ///
    /// Safe to call again on an established connection; doing so is how a
    /// dropped physical link is recovered.
    fn handshake<'a>(
        &'a self,
        role: Role,
        options: &'a HandshakeOptions,
    ) -> BoxFuture<'a, Result<Handshake>> {
        Box::pin(run_handshake(self, role, options))
    }
}

/// What a completed handshake agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// A new connection; nothing carries over.
    Fresh,
    /// The initiator asked to resume the connection it had before.
    Resumed,
}

/// Retry and cancellation settings for [`Transport::handshake`].
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Spacing between initiator attempts.
    pub interval: Duration,
    /// How long the initiator waits for a SYN-ACK before resending.
    pub attempt_timeout: Duration,
    /// Overall limit; `None` waits until cancelled.
    pub deadline: Option<Duration>,
    /// Cancels the handshake promptly when triggered.
    pub cancel: CancellationToken,
    /// Initiator only: ask the responder to resume the previous connection.
    pub resume: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HANDSHAKE_INTERVAL,
            attempt_timeout: DEFAULT_HANDSHAKE_INTERVAL,
            deadline: None,
            cancel: CancellationToken::new(),
            resume: false,
        }
    }
}

impl HandshakeOptions {
    /// Sets the overall deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the attempt interval and per-attempt timeout together.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.attempt_timeout = interval;
        self
    }

    /// Uses the given cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sends RESYNC instead of SYN when `resume` is set.
    pub fn resuming(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerFlag {
    Syn = 1,
    SynAck = 2,
    Ack = 3,
    Resync = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Marker {
    flag: MarkerFlag,
    seq: u32,
}

impl Marker {
    fn new(flag: MarkerFlag, seq: u32) -> Self {
        Self { flag, seq }
    }

    fn encode(self) -> [u8; MARKER_LEN] {
        let seq = self.seq.to_be_bytes();
        [SYNC_MAGIC, self.flag as u8, seq[0], seq[1], seq[2], seq[3]]
    }

    fn parse(rest: [u8; MARKER_LEN - 1]) -> Option<Self> {
        let flag = match rest[0] {
            1 => MarkerFlag::Syn,
            2 => MarkerFlag::SynAck,
            3 => MarkerFlag::Ack,
            4 => MarkerFlag::Resync,
            _ => return None,
        };
        let seq = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
        Some(Self { flag, seq })
    }
}

/// Drives the handshake for any transport, honouring deadline and cancel.
pub async fn run_handshake<T: Transport + ?Sized>(
    transport: &T,
    role: Role,
    options: &HandshakeOptions,
) -> Result<Handshake> {
    transport.set_established(false);

    let exchange = async {
        match role {
            Role::Initiator => {
                initiate(transport, options).await?;
                Ok(if options.resume {
                    Handshake::Resumed
                } else {
                    Handshake::Fresh
                })
            }
            Role::Responder => respond(transport).await,
        }
    };
    let deadline = async {
        match options.deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let result = tokio::select! {
        res = exchange => res,
        _ = deadline => Err(ProtocolError::TransportHandshakeTimeout(format!(
            "no answer from peer within {:?}",
            options.deadline.unwrap_or_default()
        ))),
        _ = options.cancel.cancelled() => Err(ProtocolError::TransportHandshakeTimeout(
            "handshake cancelled".to_string(),
        )),
    };

    match &result {
        Ok(outcome) => {
            transport.set_established(true);
            tracing::debug!(?role, ?outcome, "transport handshake complete");
        }
        Err(e) => tracing::debug!(?role, error = %e, "transport handshake failed"),
    }
    result
}

async fn initiate<T: Transport + ?Sized>(transport: &T, options: &HandshakeOptions) -> Result<()> {
    let mut seq: u32 = rand::random();
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let opening = if options.resume {
        MarkerFlag::Resync
    } else {
        MarkerFlag::Syn
    };

    let mut attempt: u64 = 0;
    loop {
        ticker.tick().await;
        attempt += 1;
        seq = seq.wrapping_add(4);

        if let Err(e) = transport
            .write_all(&Marker::new(opening, seq).encode())
            .await
        {
            tracing::debug!(attempt, error = %e, "failed to send sync marker");
        }

        let expected = Marker::new(MarkerFlag::SynAck, seq.wrapping_add(1));
        match tokio::time::timeout(options.attempt_timeout, await_marker(transport, expected)).await
        {
            Ok(Ok(())) => {
                transport
                    .write_all(&Marker::new(MarkerFlag::Ack, seq.wrapping_add(2)).encode())
                    .await?;
                tracing::debug!(attempt, "sync marker acknowledged");
                return Ok(());
            }
            Ok(Err(ProtocolError::TransportClosedByPeer)) => {
                return Err(ProtocolError::TransportClosedByPeer);
            }
            Ok(Err(e)) => tracing::warn!(attempt, error = %e, "handshake attempt failed, retrying"),
            Err(_) => tracing::trace!(attempt, "no sync answer yet, retrying"),
        }
    }
}

async fn respond<T: Transport + ?Sized>(transport: &T) -> Result<Handshake> {
    let mut pending: Option<Marker> = None;

    loop {
        let marker = read_marker(transport).await?;
        match marker.flag {
            MarkerFlag::Syn | MarkerFlag::Resync => {
                pending = Some(marker);
                transport
                    .write_all(&Marker::new(MarkerFlag::SynAck, marker.seq.wrapping_add(1)).encode())
                    .await?;
            }
            MarkerFlag::Ack if pending.map(|p| p.seq.wrapping_add(2)) == Some(marker.seq) => {
                return Ok(match pending.map(|p| p.flag) {
                    Some(MarkerFlag::Resync) => Handshake::Resumed,
                    _ => Handshake::Fresh,
                });
            }
            _ => tracing::trace!(?marker, "ignoring stale sync marker"),
        }
    }
}

async fn await_marker<T: Transport + ?Sized>(transport: &T, expected: Marker) -> Result<()> {
    loop {
        let marker = read_marker(transport).await?;
        if marker == expected {
            return Ok(());
        }
        tracing::trace!(?marker, ?expected, "ignoring stale sync marker");
    }
}

async fn read_marker<T: Transport + ?Sized>(transport: &T) -> Result<Marker> {
    loop {
        if read_byte(transport).await? != SYNC_MAGIC {
            continue;
        }
        let mut rest = [0u8; MARKER_LEN - 1];
        for slot in rest.iter_mut() {
            *slot = read_byte(transport).await?;
        }
        if let Some(marker) = Marker::parse(rest) {
            return Ok(marker);
        }
    }
}

async fn read_byte<T: Transport + ?Sized>(transport: &T) -> Result<u8> {
    let mut byte = [0u8; 1];
    match transport.read(&mut byte).await? {
        0 => Err(ProtocolError::TransportClosedByPeer),
        _ => Ok(byte[0]),
    }
}

/// A duplex connection built from one inbound and one outbound pipe.
pub struct HalfDuplexConn {
    reader: Mutex<Option<PipeReader>>,
    writer: Mutex<Option<PipeWriter>>,
    closed: CancellationToken,
    established: AtomicBool,
}

impl HalfDuplexConn {
    /// Joins an inbound and an outbound pipe.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_boxed(Box::new(reader), Box::new(writer))
    }

    /// Joins already-boxed pipes.
    pub fn from_boxed(reader: PipeReader, writer: PipeWriter) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
            established: AtomicBool::new(false),
        }
    }

    /// Two in-memory connections wired back to back through separate
    /// one-directional buffers, like the two halves of a serial device.
    ///
    /// Returns `(host, guest)`.
    pub fn memory_pair(capacity: usize) -> (Self, Self) {
        let (host_tx, guest_rx): (DuplexStream, DuplexStream) = tokio::io::duplex(capacity);
        let (guest_tx, host_rx): (DuplexStream, DuplexStream) = tokio::io::duplex(capacity);
        (Self::new(host_rx, host_tx), Self::new(guest_rx, guest_tx))
    }
}

impl Transport for HalfDuplexConn {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut guard = self.reader.lock().await;
            let reader = guard
                .as_mut()
                .ok_or_else(|| ProtocolError::ConnectionClosed("read pipe closed".to_string()))?;
            tokio::select! {
                res = reader.read(buf) => Ok(res?),
                _ = self.closed.cancelled() => {
                    Err(ProtocolError::ConnectionClosed("connection closed locally".to_string()))
                }
            }
        })
    }

    fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| ProtocolError::ConnectionClosed("write pipe closed".to_string()))?;
            tokio::select! {
                res = async {
                    writer.write_all(data).await?;
                    writer.flush().await
                } => Ok(res?),
                _ = self.closed.cancelled() => {
                    Err(ProtocolError::ConnectionClosed("connection closed locally".to_string()))
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.cancel();
            self.established.store(false, Ordering::SeqCst);
            if let Some(mut writer) = self.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
            self.reader.lock().await.take();
            Ok(())
        })
    }

    fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn set_established(&self, established: bool) {
        self.established.store(established, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HalfDuplexConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalfDuplexConn")
            .field("established", &self.is_established())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> HandshakeOptions {
        HandshakeOptions::default()
            .with_interval(Duration::from_millis(20))
            .with_deadline(Duration::from_secs(5))
    }

    #[test]
    fn test_marker_encoding() {
        let bytes = Marker::new(MarkerFlag::SynAck, 0x0102_0304).encode();
        assert_eq!(bytes, [SYNC_MAGIC, 2, 1, 2, 3, 4]);
        let mut rest = [0u8; MARKER_LEN - 1];
        rest.copy_from_slice(&bytes[1..]);
        assert_eq!(
            Marker::parse(rest),
            Some(Marker::new(MarkerFlag::SynAck, 0x0102_0304))
        );
        assert_eq!(
            Marker::parse([4, 0, 0, 0, 7]),
            Some(Marker::new(MarkerFlag::Resync, 7))
        );
        assert_eq!(Marker::parse([9, 0, 0, 0, 0]), None);
    }

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let (host, guest) = HalfDuplexConn::memory_pair(1024);
        let opts = fast();

        let (a, b) = tokio::join!(
            host.handshake(Role::Initiator, &opts),
            guest.handshake(Role::Responder, &opts)
        );
        assert_eq!(a.unwrap(), Handshake::Fresh);
        assert_eq!(b.unwrap(), Handshake::Fresh);
        assert!(host.is_established());
        assert!(guest.is_established());
    }

    #[tokio::test]
    async fn test_resync_reports_resumed_on_both_sides() {
        let (host, guest) = HalfDuplexConn::memory_pair(1024);
        let initiator = fast().resuming(true);
        let responder = fast();

        let (a, b) = tokio::join!(
            host.handshake(Role::Initiator, &initiator),
            guest.handshake(Role::Responder, &responder)
        );
        assert_eq!(a.unwrap(), Handshake::Resumed);
        assert_eq!(b.unwrap(), Handshake::Resumed);
    }

    #[tokio::test]
    async fn test_handshake_when_responder_starts_late() {
        let (host, guest) = HalfDuplexConn::memory_pair(1024);
        let opts = fast();

        let responder = async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            guest.handshake(Role::Responder, &opts).await
        };
        let (a, b) = tokio::join!(host.handshake(Role::Initiator, &opts), responder);
        a.unwrap();
        b.unwrap();

        // Leftover markers from the retries must not leak past the handshake.
        host.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            got += guest.read(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"after");
    }

    #[tokio::test]
    async fn test_handshake_is_repeatable() {
        let (host, guest) = HalfDuplexConn::memory_pair(1024);
        let opts = fast();

        for _ in 0..3 {
            let (a, b) = tokio::join!(
                host.handshake(Role::Initiator, &opts),
                guest.handshake(Role::Responder, &opts)
            );
            a.unwrap();
            b.unwrap();
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_fatal() {
        let (host, guest) = HalfDuplexConn::memory_pair(1024);
        guest.close().await.unwrap();
        drop(guest);

        let opts = HandshakeOptions::default()
            .with_interval(Duration::from_millis(20))
            .with_deadline(Duration::from_secs(30));
        let started = std::time::Instant::now();
        let err = host.handshake(Role::Initiator, &opts).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TransportClosedByPeer));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!host.is_established());
    }

    #[tokio::test]
    async fn test_deadline_reports_timeout() {
        let (host, _guest) = HalfDuplexConn::memory_pair(1024);
        let opts = HandshakeOptions::default()
            .with_interval(Duration::from_millis(10))
            .with_deadline(Duration::from_millis(100));

        let err = host.handshake(Role::Initiator, &opts).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TransportHandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_handshake() {
        let (_host, guest) = HalfDuplexConn::memory_pair(1024);
        let cancel = CancellationToken::new();
        let opts = HandshakeOptions::default().with_cancel(cancel.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (res, ()) = tokio::join!(guest.handshake(Role::Responder, &opts), canceller);
        assert!(matches!(
            res,
            Err(ProtocolError::TransportHandshakeTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (_host, guest) = HalfDuplexConn::memory_pair(1024);
        let guest = std::sync::Arc::new(guest);

        let reader = {
            let guest = guest.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                guest.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guest.close().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should be unblocked")
            .unwrap();
        assert!(matches!(res, Err(ProtocolError::ConnectionClosed(_))));
    }
}
