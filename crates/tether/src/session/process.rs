//! Process launcher.
//!
//! Starts the process behind a registered session and reports its
//! lifecycle to the registry. Non-terminal sessions use `tokio::process`
//! with three pipes. Terminal sessions use a `portable-pty` pair whose
//! blocking reader and writer are bridged onto in-memory duplex pipes, so
//! the rest of the agent only ever sees `AsyncRead`/`AsyncWrite`.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::SessionRegistry;
use super::state::{ProcessControl, ProcessOutput, ProcessStdin, Session, SessionError, SessionIo};

/// Buffer size for PTY reads.
const PTY_READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the in-memory pipes bridging the PTY.
const PTY_BRIDGE_CAPACITY: usize = 64 * 1024;

/// Chunks queued between the blocking PTY threads and the async bridge.
const PTY_CHANNEL_CAPACITY: usize = 32;

/// Default terminal width.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height.
pub const DEFAULT_ROWS: u16 = 24;

/// What to run for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path or name.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

impl CommandSpec {
    /// Runs `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Signals delivered by pid.
#[derive(Debug)]
struct PidControl {
    pid: u32,
}

impl PidControl {
    fn kill(&self, sig: Signal) -> Result<(), SessionError> {
        let pid = i32::try_from(self.pid)
            .map_err(|_| SessionError::SignalFailed(format!("invalid pid {}", self.pid)))?;
        signal::kill(Pid::from_raw(pid), sig).map_err(|e| SessionError::SignalFailed(e.to_string()))
    }
}

impl ProcessControl for PidControl {
    fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
        Err(SessionError::ResizeFailed("process has no terminal".to_string()))
    }

    fn signal(&self, sig: Signal) -> Result<(), SessionError> {
        self.kill(sig)
    }
}

/// Resize through the PTY master, signals by pid.
struct PtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    pid: Option<u32>,
}

impl ProcessControl for PtyControl {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        tracing::debug!(pid = ?self.pid, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    fn signal(&self, sig: Signal) -> Result<(), SessionError> {
        let pid = self
            .pid
            .ok_or_else(|| SessionError::SignalFailed("process id unknown".to_string()))?;
        PidControl { pid }.kill(sig)
    }
}

/// Starts session processes and reports them to the registry.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    registry: Arc<SessionRegistry>,
}

impl ProcessLauncher {
    /// Creates a launcher reporting to `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Runs the session's process in the background.
    pub fn launch(&self, session: Arc<Session>, command: CommandSpec) -> JoinHandle<()> {
        let launcher = self.clone();
        tokio::spawn(async move {
            let id = session.id().clone();
            if let Err(e) = launcher.run(session, command).await {
                tracing::error!(session_id = %id, error = %e, "Session process failed");
            }
        })
    }

    /// Waits for `run_block` release, runs the process to completion and
    /// returns its exit code.
    pub async fn run(
        &self,
        session: Arc<Session>,
        command: CommandSpec,
    ) -> Result<Option<i32>, SessionError> {
        let id = session.id().clone();
        if session.config().run_block {
            tracing::info!(session_id = %id, "Waiting for a client before starting");
        }
        session.wait_unblocked().await;

        let result = if session.is_tty() {
            self.run_pty(&id, command).await
        } else {
            self.run_piped(&id, command).await
        };

        let exit_code = match &result {
            Ok(code) => *code,
            Err(_) => None,
        };
        self.registry.notify_exited(&id, exit_code)?;
        result
    }

    async fn run_piped(&self, id: &str, command: CommandSpec) -> Result<Option<i32>, SessionError> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", command.program, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("stdout not captured".to_string()))?;

        let io = SessionIo {
            stdin: child
                .stdin
                .take()
                .map(|s| Box::new(s) as ProcessStdin),
            stdout: Box::new(stdout),
            stderr: child
                .stderr
                .take()
                .map(|s| Box::new(s) as ProcessOutput),
        };
        let control = child
            .id()
            .map(|pid| Arc::new(PidControl { pid }) as Arc<dyn ProcessControl>);

        tracing::info!(session_id = %id, pid = ?child.id(), program = %command.program, "Spawned process");
        self.registry.notify_started(id, io, control).await?;

        let status = child.wait().await?;
        Ok(status.code().or_else(|| status.signal().map(|s| 128 + s)))
    }

    async fn run_pty(&self, id: &str, command: CommandSpec) -> Result<Option<i32>, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: command.rows,
                cols: command.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        if let Some(cwd) = &command.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", command.program, e)))?;
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let io = SessionIo {
            stdin: Some(Box::new(bridge_pty_input(id.to_string(), writer))),
            stdout: Box::new(bridge_pty_output(id.to_string(), reader)),
            stderr: None,
        };
        let control = Arc::new(PtyControl {
            master: Mutex::new(pair.master),
            pid,
        });

        tracing::info!(session_id = %id, pid = ?pid, program = %command.program, "Spawned process on PTY");
        self.registry.notify_started(id, io, Some(control)).await?;

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))??;
        Ok(Some(status.exit_code() as i32))
    }
}

/// Exposes the blocking PTY reader as an async pipe.
fn bridge_pty_output(session_id: String, mut reader: Box<dyn Read + Send>) -> tokio::io::DuplexStream {
    let (mut async_side, process_side) = tokio::io::duplex(PTY_BRIDGE_CAPACITY);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; PTY_READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                // EIO once the child side of the PTY is gone
                Err(_) => break,
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = async_side.write_all(&chunk).await {
                tracing::debug!(session_id = %session_id, error = %e, "PTY output bridge closed");
                break;
            }
        }
    });

    process_side
}

/// Exposes the blocking PTY writer as an async pipe.
fn bridge_pty_input(session_id: String, mut writer: Box<dyn Write + Send>) -> tokio::io::DuplexStream {
    let (async_side, mut process_side) = tokio::io::duplex(PTY_BRIDGE_CAPACITY);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut buffer = vec![0u8; PTY_READ_BUFFER_SIZE];
        loop {
            match process_side.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                tracing::debug!(session_id = %session_id, error = %e, "PTY input bridge closed");
                break;
            }
        }
        // Dropping the writer signals end-of-input to the terminal.
    });

    async_side
}
