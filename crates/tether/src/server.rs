//! Attach server.
//!
//! Serves one authenticated client at a time over a [`Transport`]. The
//! client lists sessions, opens streams bound to them, and issues resize
//! and signal requests scoped to an open stream.
//!
//! ## Tasks per connection
//!
//! ```text
//!                 ┌──────────────┐   outbound mpsc   ┌──────────────┐
//! channel.recv ──►│ reader loop  │──────────────────►│ writer task  │──► channel.send
//!                 └──────┬───────┘        ▲          └──────────────┘
//!                        │ stdin mpsc     │
//!                        ▼                │
//!                 ┌──────────────┐  ┌─────┴────────┐
//!                 │ stdin task   │  │ output pumps │  (one pair per stream)
//!                 └──────────────┘  └──────────────┘
//! ```
//!
//! Ending a stream only ever detaches the session. Losing the connection
//! detaches every stream it carried.
//!
//! The reader loop never waits on a process. Stdin is queued per stream
//! with `try_send`; a stream whose process stops reading fills its queue
//! and is detached with [`ErrorCode::InputOverflow`], while every other
//! stream and request keeps flowing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use protocol::messages::{
    CloseStdin, ControlAck, ListSessions, OpenStream, Ping, Pong, ResizeRequest, SessionExited,
    SessionList, SignalRequest, StreamClose, StreamData, StreamEof, StreamOpened,
};
use protocol::{
    AttachError, AttachKey, DataStream, ErrorCode, ErrorMessage, Message, ProtocolError,
    SecureChannel, Transport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pump::{pump_output, PumpEnd, StdinSink};
use crate::session::{parse_signal, Binding, Session, SessionError, SessionRegistry};

/// Default depth of the outbound message queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Default depth of each stream's stdin queue.
pub const DEFAULT_STDIN_CAPACITY: usize = 64;

/// How long a detaching stream waits to hand held-back terminal input to
/// its process.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors ending a served connection.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Another client is already being served.
    #[error("another client is already connected")]
    AlreadyConnected,

    /// Protocol or link failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ServerError {
    /// Whether the connection ended because the link went away.
    pub fn is_link_error(&self) -> bool {
        matches!(self, ServerError::Protocol(e) if e.is_link_error())
    }
}

/// Tuning for [`AttachServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Outbound messages queued before pumps wait.
    pub outbound_capacity: usize,
    /// Stdin chunks queued per stream. A stream whose queue fills is
    /// detached.
    pub stdin_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            stdin_capacity: DEFAULT_STDIN_CAPACITY,
        }
    }
}

/// Guest-side attach server.
pub struct AttachServer {
    registry: Arc<SessionRegistry>,
    key: AttachKey,
    options: ServerOptions,
    connected: AtomicBool,
}

impl AttachServer {
    /// Creates a server over `registry`, authenticating clients with `key`.
    pub fn new(registry: Arc<SessionRegistry>, key: AttachKey, options: ServerOptions) -> Self {
        Self {
            registry,
            key,
            options,
            connected: AtomicBool::new(false),
        }
    }

    /// The registry this server exposes.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether a client is currently being served.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Authenticates and serves one client until it goes away.
    ///
    /// A second concurrent client is refused during authentication.
    pub async fn serve_connection(&self, transport: Arc<dyn Transport>) -> Result<(), ServerError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            tracing::warn!("Refusing client: another client is connected");
            SecureChannel::reject(transport.as_ref()).await?;
            return Err(ServerError::AlreadyConnected);
        }
        let _connected = ConnectedGuard(&self.connected);

        let channel = match SecureChannel::accept(transport, &self.key).await {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                tracing::warn!(error = %e, "Client authentication failed");
                return Err(e.into());
            }
        };
        tracing::info!("Client authenticated");

        let connection = Connection::new(self.registry.clone(), channel.clone(), &self.options);
        let result = connection.run().await;
        connection.shutdown().await;
        let _ = channel.close().await;

        match &result {
            Err(e) if e.is_link_error() => tracing::info!(error = %e, "Client disconnected"),
            Err(e) => tracing::warn!(error = %e, "Connection failed"),
            Ok(()) => tracing::info!("Connection closed"),
        }
        result.map_err(Into::into)
    }
}

impl std::fmt::Debug for AttachServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachServer")
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct ConnectedGuard<'a>(&'a AtomicBool);

impl Drop for ConnectedGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Lifecycle of a stream inside the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Open,
    Closing,
}

/// Input for a stream's stdin task, applied in order.
#[derive(Debug)]
enum StdinOp {
    Data(Vec<u8>),
    Close(u64),
}

struct StreamState {
    session: Arc<Session>,
    phase: StreamPhase,
    stdin: mpsc::Sender<StdinOp>,
    stop: CancellationToken,
}

/// One authenticated client.
struct Connection {
    registry: Arc<SessionRegistry>,
    outbound: mpsc::Sender<Message>,
    streams: Arc<DashMap<u32, StreamState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    channel: Arc<SecureChannel>,
    lost: CancellationToken,
    stdin_capacity: usize,
}

impl Connection {
    fn new(registry: Arc<SessionRegistry>, channel: Arc<SecureChannel>, options: &ServerOptions) -> Self {
        let (outbound, rx) = mpsc::channel(options.outbound_capacity);
        let lost = CancellationToken::new();
        let writer = tokio::spawn(write_loop(channel.clone(), rx, lost.clone()));

        Self {
            registry,
            outbound,
            streams: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            writer: Mutex::new(Some(writer)),
            channel,
            lost,
            stdin_capacity: options.stdin_capacity,
        }
    }

    async fn run(&self) -> Result<(), ProtocolError> {
        loop {
            let message = tokio::select! {
                message = self.channel.recv() => message?,
                _ = self.lost.cancelled() => {
                    return Err(ProtocolError::ConnectionClosed("outbound link failed".to_string()));
                }
            };
            self.dispatch(message).await;
        }
    }

    /// Detaches every stream and stops the writer.
    async fn shutdown(&self) {
        self.lost.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::ListSessions(ListSessions { request_id }) => {
                let session_ids = self.registry.ids();
                tracing::debug!(count = session_ids.len(), "Listing sessions");
                self.send(Message::SessionList(SessionList {
                    request_id,
                    session_ids,
                }))
                .await;
            }
            Message::Ping(Ping { request_id }) => {
                self.send(Message::Pong(Pong { request_id })).await;
            }
            Message::OpenStream(request) => self.open_stream(request).await,
            Message::StreamData(StreamData {
                stream_id,
                stream: DataStream::Stdin,
                data,
            }) => {
                self.queue_stdin(stream_id, StdinOp::Data(data)).await;
            }
            Message::CloseStdin(CloseStdin {
                request_id,
                stream_id,
            }) => {
                if !self.queue_stdin(stream_id, StdinOp::Close(request_id)).await {
                    self.send_error(Some(request_id), ErrorCode::InvalidRequest, unknown_stream(stream_id), None)
                        .await;
                }
            }
            Message::StreamEof(StreamEof {
                stream_id,
                stream: DataStream::Stdin,
            }) => self.detach(stream_id, "stdin closed"),
            Message::StreamClose(StreamClose { stream_id }) => self.detach(stream_id, "stream closed"),
            Message::Resize(request) => self.resize(request).await,
            Message::Signal(request) => self.signal(request).await,
            other => {
                tracing::warn!(message = ?other, "Unexpected message from client");
                self.send_error(
                    None,
                    ErrorCode::InvalidRequest,
                    "unexpected message".to_string(),
                    None,
                )
                .await;
            }
        }
    }

    async fn open_stream(&self, request: OpenStream) {
        let OpenStream {
            request_id,
            stream_id,
            session_id,
            log_only,
        } = request;

        if self.streams.contains_key(&stream_id) {
            self.send_error(
                Some(request_id),
                ErrorCode::InvalidRequest,
                format!("stream {} already open", stream_id),
                Some(session_id),
            )
            .await;
            return;
        }

        let bound = self
            .registry
            .get(&session_id)
            .ok_or_else(|| AttachError::NoSuchSession(session_id.clone()))
            .and_then(|session| session.bind(log_only).map(|binding| (session, binding)));
        let (session, binding) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::info!(session_id = %session_id, stream_id = stream_id, error = %e, "Attach refused");
                self.send_error(Some(request_id), e.code(), e.to_string(), Some(session_id))
                    .await;
                return;
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::channel(self.stdin_capacity);
        let stop = self.lost.child_token();
        self.streams.insert(
            stream_id,
            StreamState {
                session: session.clone(),
                phase: StreamPhase::Open,
                stdin: stdin_tx,
                stop: stop.clone(),
            },
        );

        let tty = binding.tty;
        self.send(Message::StreamOpened(StreamOpened {
            request_id,
            stream_id,
            tty,
        }))
        .await;
        tracing::info!(session_id = %session_id, stream_id = stream_id, tty = tty, log_only = log_only, "Stream opened");

        let task = tokio::spawn(run_stream(StreamTask {
            stream_id,
            session,
            binding,
            stdin: stdin_rx,
            outbound: self.outbound.clone(),
            streams: self.streams.clone(),
            stop,
            lost: self.lost.clone(),
        }));

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Queues stdin work for a stream without waiting for the process.
    /// Returns false if the stream is unknown or no longer takes input.
    async fn queue_stdin(&self, stream_id: u32, op: StdinOp) -> bool {
        let queue = self
            .streams
            .get(&stream_id)
            .filter(|s| s.phase == StreamPhase::Open)
            .map(|s| (s.stdin.clone(), s.session.clone()));
        let Some((stdin, session)) = queue else {
            tracing::debug!(stream_id = stream_id, "Input for unknown stream dropped");
            return false;
        };

        let request_id = match &op {
            StdinOp::Close(request_id) => Some(*request_id),
            StdinOp::Data(_) => None,
        };
        match stdin.try_send(op) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    stream_id = stream_id,
                    session_id = %session.id(),
                    capacity = self.stdin_capacity,
                    "Process is not reading stdin"
                );
                self.detach(stream_id, "stdin overflow");
                self.send_error(
                    request_id,
                    ErrorCode::InputOverflow,
                    format!("stdin of stream {} overflowed, stream detached", stream_id),
                    Some(session.id().clone()),
                )
                .await;
                true
            }
        }
    }

    fn detach(&self, stream_id: u32, reason: &'static str) {
        if let Some(mut stream) = self.streams.get_mut(&stream_id) {
            if stream.phase == StreamPhase::Open {
                stream.phase = StreamPhase::Closing;
                stream.stop.cancel();
                tracing::info!(stream_id = stream_id, session_id = %stream.session.id(), reason = reason, "Detaching stream");
            }
        }
    }

    fn stream_session(&self, stream_id: u32) -> Option<Arc<Session>> {
        self.streams
            .get(&stream_id)
            .filter(|s| s.phase == StreamPhase::Open)
            .map(|s| s.session.clone())
    }

    async fn resize(&self, request: ResizeRequest) {
        let ResizeRequest {
            request_id,
            stream_id,
            cols,
            rows,
        } = request;
        let Some(session) = self.stream_session(stream_id) else {
            self.send_error(Some(request_id), ErrorCode::InvalidRequest, unknown_stream(stream_id), None)
                .await;
            return;
        };

        let result = session.resize(cols, rows);
        self.acknowledge(request_id, &session, result).await;
    }

    async fn signal(&self, request: SignalRequest) {
        let SignalRequest {
            request_id,
            stream_id,
            name,
        } = request;
        let Some(session) = self.stream_session(stream_id) else {
            self.send_error(Some(request_id), ErrorCode::InvalidRequest, unknown_stream(stream_id), None)
                .await;
            return;
        };

        let result = parse_signal(&name).and_then(|signal| session.signal(signal));
        self.acknowledge(request_id, &session, result).await;
    }

    async fn acknowledge(&self, request_id: u64, session: &Session, result: Result<(), SessionError>) {
        match result {
            Ok(()) => self.send(Message::ControlAck(ControlAck { request_id })).await,
            Err(e) => {
                self.send_error(
                    Some(request_id),
                    session_error_code(&e),
                    e.to_string(),
                    Some(session.id().clone()),
                )
                .await
            }
        }
    }

    async fn send(&self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            tracing::debug!("Outbound queue closed, message dropped");
        }
    }

    async fn send_error(&self, request_id: Option<u64>, code: ErrorCode, message: String, context: Option<String>) {
        self.send(Message::Error(ErrorMessage {
            request_id,
            code,
            message,
            context,
        }))
        .await;
    }
}

fn unknown_stream(stream_id: u32) -> String {
    format!("unknown stream {}", stream_id)
}

fn session_error_code(error: &SessionError) -> ErrorCode {
    match error {
        SessionError::NotTty(_) => ErrorCode::NotTty,
        SessionError::InvalidSignal(_) => ErrorCode::InvalidSignal,
        SessionError::Exited(_) => ErrorCode::ProcessExited,
        SessionError::NotFound(_) => ErrorCode::NoSuchSession,
        _ => ErrorCode::Internal,
    }
}

async fn write_loop(channel: Arc<SecureChannel>, mut rx: mpsc::Receiver<Message>, lost: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = lost.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = channel.send(message).await {
            tracing::warn!(error = %e, "Failed to send message");
            lost.cancel();
            break;
        }
    }
}

struct StreamTask {
    stream_id: u32,
    session: Arc<Session>,
    binding: Binding,
    stdin: mpsc::Receiver<StdinOp>,
    outbound: mpsc::Sender<Message>,
    streams: Arc<DashMap<u32, StreamState>>,
    stop: CancellationToken,
    lost: CancellationToken,
}

/// Drives one bound stream from open to close, then releases the session.
async fn run_stream(task: StreamTask) {
    let StreamTask {
        stream_id,
        session,
        binding,
        stdin,
        outbound,
        streams,
        stop,
        lost,
    } = task;
    let Binding {
        id: binding_id,
        stdout,
        stderr,
        tty,
    } = binding;

    let stdin_task = tokio::spawn(run_stdin(
        stream_id,
        StdinSink::new(session.clone(), tty),
        stdin,
        outbound.clone(),
        stop.clone(),
        lost.clone(),
    ));

    let ((stdout_end, stdout), (stderr_end, stderr)) = tokio::join!(
        pump_output(stream_id, DataStream::Stdout, stdout, tty, outbound.clone(), stop.clone()),
        pump_output(stream_id, DataStream::Stderr, stderr, tty, outbound.clone(), stop.clone()),
    );

    if stdout_end == PumpEnd::Eof && stderr_end == PumpEnd::Eof {
        tokio::select! {
            exit_code = session.wait_exit() => {
                let _ = outbound
                    .send(Message::SessionExited(SessionExited { stream_id, exit_code }))
                    .await;
            }
            _ = stop.cancelled() => {}
        }
    }

    stop.cancel();
    if let Err(e) = stdin_task.await {
        tracing::warn!(stream_id = stream_id, error = %e, "Stdin task failed");
    }

    session.release(binding_id, stdout, stderr);
    streams.remove(&stream_id);
    if !lost.is_cancelled() {
        let _ = outbound.send(Message::StreamClose(StreamClose { stream_id })).await;
    }
    tracing::info!(stream_id = stream_id, session_id = %session.id(), status = %session.status(), "Stream closed");
}

/// Applies client input in arrival order until the stream stops.
async fn run_stdin(
    stream_id: u32,
    mut sink: StdinSink,
    mut rx: mpsc::Receiver<StdinOp>,
    outbound: mpsc::Sender<Message>,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let mut accepting = true;
    loop {
        // Input queued before the stream stopped is still delivered.
        let op = tokio::select! {
            biased;
            op = rx.recv() => op,
            _ = stop.cancelled() => None,
        };
        let Some(op) = op else {
            break;
        };

        match op {
            StdinOp::Data(data) if accepting => {
                // A write the process never drains is abandoned on detach.
                let result = tokio::select! {
                    biased;
                    result = sink.write(&data) => result,
                    _ = stop.cancelled() => break,
                };
                if let Err(e) = result {
                    tracing::debug!(stream_id = stream_id, error = %e, "Process no longer accepts input");
                    accepting = false;
                }
            }
            StdinOp::Data(_) => {}
            StdinOp::Close(request_id) => {
                accepting = false;
                let closed = tokio::select! {
                    biased;
                    closed = sink.close() => closed,
                    _ = stop.cancelled() => break,
                };
                let reply = match closed {
                    Ok(()) => Message::ControlAck(ControlAck { request_id }),
                    Err(e) => Message::Error(ErrorMessage {
                        request_id: Some(request_id),
                        code: session_error_code(&e),
                        message: e.to_string(),
                        context: None,
                    }),
                };
                let _ = outbound.send(reply).await;
            }
        }
    }

    if accepting && !lost.is_cancelled() {
        let flushed = tokio::select! {
            flushed = sink.flush() => flushed,
            _ = lost.cancelled() => Ok(()),
            _ = tokio::time::sleep(FLUSH_TIMEOUT) => Ok(()),
        };
        if let Err(e) = flushed {
            tracing::debug!(stream_id = stream_id, error = %e, "Failed to flush pending input");
        }
    }
}
