//! Session state and lifecycle.
//!
//! A [`Session`] represents one guest process exposed for attach. It is
//! registered before the process starts, receives the process I/O handles
//! when the supervisor reports the start, and keeps draining output through
//! its [`OutputRelay`]s until the process closes them.
//!
//! ## Status transitions
//!
//! ```text
//! Pending ──start/attach──► Running ◄──attach── Detached
//!                              │ └──detach──────────►│
//!                              └───────exit──► Exited ◄┘
//! ```

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use nix::sys::signal::Signal;
use protocol::AttachError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use super::relay::{OutputReceiver, OutputRelay};
use crate::liveness::Liveness;

/// Unique identifier for a session.
pub type SessionId = String;

/// Boxed process stdin.
pub type ProcessStdin = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed process output.
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A session with this id is already registered.
    #[error("session already registered: {0}")]
    AlreadyRegistered(SessionId),

    /// The session's process has not exited yet.
    #[error("session still running: {0}")]
    StillRunning(SessionId),

    /// The session's process was already started.
    #[error("session already started: {0}")]
    AlreadyStarted(SessionId),

    /// The process has not been started yet.
    #[error("process not started: {0}")]
    NotStarted(SessionId),

    /// The process has exited.
    #[error("process exited: {0}")]
    Exited(SessionId),

    /// The session has no pseudo-terminal.
    #[error("session has no terminal: {0}")]
    NotTty(SessionId),

    /// The process stdin was closed.
    #[error("stdin closed: {0}")]
    StdinClosed(SessionId),

    /// Failed to spawn the process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Unknown signal name.
    #[error("unknown signal: {0}")]
    InvalidSignal(String),

    /// Failed to deliver a signal.
    #[error("failed to deliver signal: {0}")]
    SignalFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Registered, process not started.
    Pending,
    /// Process running (attached or never attached).
    Running,
    /// Process running, last stream detached.
    Detached,
    /// Process terminated. Terminal state.
    Exited,
}

impl SessionStatus {
    /// Lowercase name used in liveness keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Detached => "detached",
            SessionStatus::Exited => "exited",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable attributes of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Unique id within the registry.
    pub id: SessionId,
    /// Human label.
    pub name: String,
    /// Whether the process runs on a pseudo-terminal.
    pub tty: bool,
    /// Whether streams may bind at all.
    pub attachable: bool,
    /// Whether the process start waits for a client to continue it.
    pub run_block: bool,
}

impl SessionConfig {
    /// An attachable, non-TTY session that starts immediately.
    pub fn new(id: impl Into<SessionId>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tty: false,
            attachable: true,
            run_block: false,
        }
    }

    /// Sets the TTY flag.
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Sets the attachable flag.
    pub fn attachable(mut self, attachable: bool) -> Self {
        self.attachable = attachable;
        self
    }

    /// Sets the run-block flag.
    pub fn run_block(mut self, run_block: bool) -> Self {
        self.run_block = run_block;
        self
    }
}

/// Out-of-band operations on a running process.
pub trait ProcessControl: Send + Sync {
    /// Resizes the process terminal.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Delivers a signal to the process.
    fn signal(&self, signal: Signal) -> Result<(), SessionError>;
}

/// Parses a conventional signal name (`HUP`, `SIGHUP`, `sigterm`) or number.
pub fn parse_signal(name: &str) -> Result<Signal, SessionError> {
    let trimmed = name.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| SessionError::InvalidSignal(name.to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| SessionError::InvalidSignal(name.to_string()))
}

/// Process I/O handles handed over when the process starts.
pub struct SessionIo {
    /// Process stdin, if it accepts input.
    pub stdin: Option<ProcessStdin>,
    /// Process stdout (the terminal output for TTY sessions).
    pub stdout: ProcessOutput,
    /// Process stderr; `None` when merged into stdout.
    pub stderr: Option<ProcessOutput>,
}

impl SessionIo {
    /// Bundles the three handles.
    pub fn new<W, R, E>(stdin: W, stdout: R, stderr: Option<E>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stdin: Some(Box::new(stdin)),
            stdout: Box::new(stdout),
            stderr: stderr.map(|e| Box::new(e) as ProcessOutput),
        }
    }
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo")
            .field("stdin", &self.stdin.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Output receivers granted to the stream bound to a session.
#[derive(Debug)]
pub struct Binding {
    /// Identifies this binding when releasing it.
    pub id: u64,
    /// Replay-then-live stdout.
    pub stdout: OutputReceiver,
    /// Replay-then-live stderr.
    pub stderr: OutputReceiver,
    /// Whether the session runs on a pseudo-terminal.
    pub tty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoPhase {
    Pending,
    Started,
    Gone,
}

enum StdinSlot {
    Pending,
    Open(ProcessStdin),
    Closed,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    bound: Option<u64>,
    exit_code: Option<i32>,
}

/// One guest process exposed for attach.
pub struct Session {
    config: SessionConfig,
    state: Mutex<SessionState>,
    stdin: tokio::sync::Mutex<StdinSlot>,
    io_phase: watch::Sender<IoPhase>,
    unblocked: watch::Sender<bool>,
    stdout: OutputRelay,
    stderr: OutputRelay,
    control: RwLock<Option<Arc<dyn ProcessControl>>>,
    next_binding: AtomicU64,
    liveness: OnceLock<Liveness>,
}

impl Session {
    /// Creates a Pending session retaining up to `buffer_limit` bytes per
    /// output while detached.
    pub fn new(config: SessionConfig, buffer_limit: usize) -> Self {
        Self {
            config,
            state: Mutex::new(SessionState {
                status: SessionStatus::Pending,
                bound: None,
                exit_code: None,
            }),
            stdin: tokio::sync::Mutex::new(StdinSlot::Pending),
            io_phase: watch::Sender::new(IoPhase::Pending),
            unblocked: watch::Sender::new(false),
            stdout: OutputRelay::new("stdout", buffer_limit),
            stderr: OutputRelay::new("stderr", buffer_limit),
            control: RwLock::new(None),
            next_binding: AtomicU64::new(1),
            liveness: OnceLock::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes attach-driven status changes through `liveness`. Only the
    /// first call has an effect.
    pub fn report_to(&self, liveness: Liveness) {
        let _ = self.liveness.set(liveness);
    }

    fn report_status(&self, status: SessionStatus) {
        if let Some(liveness) = self.liveness.get() {
            liveness.session_status(self.id(), status);
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.config.id
    }

    /// Returns the human label.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the immutable attributes.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns whether the process has a pseudo-terminal.
    pub fn is_tty(&self) -> bool {
        self.config.tty
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Exit code, once the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    /// Whether a stream is currently bound.
    pub fn is_bound(&self) -> bool {
        self.lock_state().bound.is_some()
    }

    /// Bytes of stdout retained for the next attach.
    pub fn buffered_stdout(&self) -> usize {
        self.stdout.buffered_len()
    }

    /// Binds a stream to this session's output and input.
    ///
    /// `log_only` permits binding an exited session to replay its
    /// retained output.
    pub fn bind(&self, log_only: bool) -> Result<Binding, AttachError> {
        if !self.config.attachable {
            return Err(AttachError::NotAttachable(self.id().clone()));
        }

        let (id, resumed) = {
            let mut state = self.lock_state();
            if state.bound.is_some() {
                return Err(AttachError::AlreadyBound(self.id().clone()));
            }
            if state.status == SessionStatus::Exited && !log_only {
                return Err(AttachError::NotRunning(self.id().clone()));
            }

            let id = self.next_binding.fetch_add(1, Ordering::Relaxed);
            state.bound = Some(id);
            let resumed = match state.status {
                SessionStatus::Pending => {
                    self.unblocked.send_replace(true);
                    true
                }
                SessionStatus::Detached => true,
                SessionStatus::Running | SessionStatus::Exited => false,
            };
            if resumed {
                state.status = SessionStatus::Running;
            }
            (id, resumed)
        };

        if resumed {
            self.report_status(SessionStatus::Running);
        }
        tracing::debug!(session_id = %self.id(), binding = id, "Stream bound");
        Ok(Binding {
            id,
            stdout: self.stdout.bind(),
            stderr: self.stderr.bind(),
            tty: self.config.tty,
        })
    }

    /// Releases a binding. The process keeps running; unconsumed output is
    /// kept for the next attach.
    pub fn release(&self, binding_id: u64, stdout: OutputReceiver, stderr: OutputReceiver) {
        let status = {
            let mut state = self.lock_state();
            if state.bound != Some(binding_id) {
                tracing::warn!(session_id = %self.id(), binding = binding_id, "Releasing stale binding");
                return;
            }

            self.stdout.unbind(stdout);
            self.stderr.unbind(stderr);
            state.bound = None;
            if state.status == SessionStatus::Running {
                state.status = SessionStatus::Detached;
            }
            state.status
        };
        if status == SessionStatus::Detached {
            self.report_status(status);
        }
        tracing::debug!(session_id = %self.id(), status = %status, "Stream released");
    }

    /// Releases a `run_block` session without attaching.
    pub fn unblock(&self) {
        self.unblocked.send_replace(true);
    }

    /// Resolves once the process may start.
    pub async fn wait_unblocked(&self) {
        if !self.config.run_block {
            return;
        }
        let mut rx = self.unblocked.subscribe();
        let _ = rx.wait_for(|unblocked| *unblocked).await;
    }

    /// Installs the process handles and starts draining its output.
    pub async fn start(
        &self,
        io: SessionIo,
        control: Option<Arc<dyn ProcessControl>>,
    ) -> Result<(), SessionError> {
        if *self.io_phase.borrow() != IoPhase::Pending {
            return Err(SessionError::AlreadyStarted(self.id().clone()));
        }

        *self.stdin.lock().await = match io.stdin {
            Some(stdin) => StdinSlot::Open(stdin),
            None => StdinSlot::Closed,
        };
        *self.control.write().unwrap_or_else(|e| e.into_inner()) = control;

        self.stdout.start(io.stdout, self.id().clone());
        match io.stderr {
            Some(stderr) => {
                self.stderr.start(stderr, self.id().clone());
            }
            None => self.stderr.finish(),
        }

        {
            let mut state = self.lock_state();
            if state.status == SessionStatus::Pending {
                state.status = SessionStatus::Running;
            }
        }
        self.io_phase.send_replace(IoPhase::Started);
        tracing::info!(session_id = %self.id(), tty = self.config.tty, "Process started");
        Ok(())
    }

    /// Records process termination.
    pub fn mark_exited(&self, exit_code: Option<i32>) {
        let previous = self.io_phase.send_replace(IoPhase::Gone);
        if previous == IoPhase::Pending {
            // Never started: nothing will ever arrive on the outputs.
            self.stdout.finish();
            self.stderr.finish();
        }

        let mut state = self.lock_state();
        state.status = SessionStatus::Exited;
        state.exit_code = exit_code;
        tracing::info!(session_id = %self.id(), exit_code = ?exit_code, "Process exited");
    }

    /// Waits for the process to exit and returns its exit code.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.io_phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == IoPhase::Gone).await;
        self.exit_code()
    }

    /// Writes bytes to the process stdin, waiting for the process to start.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut rx = self.io_phase.subscribe();
        let phase = rx
            .wait_for(|phase| *phase != IoPhase::Pending)
            .await
            .map(|phase| *phase)
            .unwrap_or(IoPhase::Gone);
        if phase == IoPhase::Gone {
            return Err(SessionError::Exited(self.id().clone()));
        }

        let mut slot = self.stdin.lock().await;
        match &mut *slot {
            StdinSlot::Open(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await?;
                Ok(())
            }
            StdinSlot::Closed => Err(SessionError::StdinClosed(self.id().clone())),
            StdinSlot::Pending => Err(SessionError::NotStarted(self.id().clone())),
        }
    }

    /// Closes the process stdin. The stream stays bound.
    pub async fn close_stdin(&self) -> Result<(), SessionError> {
        let mut slot = self.stdin.lock().await;
        if let StdinSlot::Open(mut stdin) = std::mem::replace(&mut *slot, StdinSlot::Closed) {
            stdin.shutdown().await?;
            tracing::debug!(session_id = %self.id(), "Process stdin closed");
        }
        Ok(())
    }

    fn process_control(&self) -> Result<Arc<dyn ProcessControl>, SessionError> {
        if self.status() == SessionStatus::Exited {
            return Err(SessionError::Exited(self.id().clone()));
        }
        self.control
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SessionError::NotStarted(self.id().clone()))
    }

    /// Resizes the terminal. Only valid for TTY sessions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.config.tty {
            return Err(SessionError::NotTty(self.id().clone()));
        }
        self.process_control()?.resize(cols, rows)
    }

    /// Delivers a signal to the process.
    pub fn signal(&self, signal: Signal) -> Result<(), SessionError> {
        self.process_control()?.signal(signal)?;
        tracing::info!(session_id = %self.id(), signal = signal.as_str(), "Signal delivered");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("state", &*self.lock_state())
            .finish()
    }
}
