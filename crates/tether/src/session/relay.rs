//! Output relays: continuous draining of process output.
//!
//! A relay owns one process output pipe for the whole life of the process.
//! Its drain task never stops reading, so a detached process cannot block
//! on a full pipe. While a stream is bound, chunks go straight to the
//! stream's sink; otherwise they are retained in a bounded buffer. Binding
//! replays that buffer before any live chunk, and unbinding hands back
//! whatever the stream had not consumed yet.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// An item delivered to a bound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Output bytes in production order.
    Data(Bytes),
    /// The process closed this output.
    Eof,
}

/// Receiving end handed to a bound stream.
pub type OutputReceiver = mpsc::UnboundedReceiver<OutputEvent>;

#[derive(Debug, Default)]
struct RelayState {
    buffer: VecDeque<Bytes>,
    buffered_bytes: usize,
    dropped_bytes: u64,
    sink: Option<mpsc::UnboundedSender<OutputEvent>>,
    eof: bool,
}

impl RelayState {
    fn retain(&mut self, chunk: Bytes, limit: usize) {
        self.buffered_bytes += chunk.len();
        self.buffer.push_back(chunk);
        self.enforce_limit(limit);
    }

    fn enforce_limit(&mut self, limit: usize) {
        while self.buffered_bytes > limit {
            let Some(oldest) = self.buffer.pop_front() else {
                break;
            };
            self.buffered_bytes -= oldest.len();
            self.dropped_bytes += oldest.len() as u64;
        }
    }
}

/// Drains one process output and routes it to a bound stream or a buffer.
#[derive(Debug, Clone)]
pub struct OutputRelay {
    label: &'static str,
    limit: usize,
    state: Arc<Mutex<RelayState>>,
}

impl OutputRelay {
    /// Creates an idle relay that retains at most `limit` bytes while unbound.
    pub fn new(label: &'static str, limit: usize) -> Self {
        Self {
            label,
            limit,
            state: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        // A poisoned relay still holds consistent buffers; keep serving it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts draining `reader` until end-of-stream.
    pub fn start<R>(&self, mut reader: R, session_id: String) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => relay.deliver(Bytes::copy_from_slice(&buf[..n]), &session_id),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            output = relay.label,
                            error = %e,
                            "Error reading process output"
                        );
                        break;
                    }
                }
            }
            tracing::debug!(session_id = %session_id, output = relay.label, "Process output closed");
            relay.finish();
        })
    }

    fn deliver(&self, chunk: Bytes, session_id: &str) {
        let mut state = self.lock();

        let chunk = match state.sink.take() {
            Some(sink) => match sink.send(OutputEvent::Data(chunk)) {
                Ok(()) => {
                    state.sink = Some(sink);
                    return;
                }
                // The stream went away without unbinding; keep the bytes.
                Err(mpsc::error::SendError(OutputEvent::Data(chunk))) => chunk,
                Err(_) => return,
            },
            None => chunk,
        };

        let dropped_before = state.dropped_bytes;
        state.retain(chunk, self.limit);
        if state.dropped_bytes > dropped_before {
            tracing::warn!(
                session_id = %session_id,
                output = self.label,
                dropped = state.dropped_bytes - dropped_before,
                "Detached output buffer full, discarding oldest bytes"
            );
        }
    }

    /// Marks the output as finished without a reader.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.eof = true;
        if let Some(sink) = state.sink.take() {
            let _ = sink.send(OutputEvent::Eof);
        }
    }

    /// Binds a new stream: replays retained output, then switches to live.
    ///
    /// If the output already ended the receiver yields the replay followed
    /// by [`OutputEvent::Eof`].
    pub fn bind(&self) -> OutputReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        for chunk in state.buffer.drain(..) {
            let _ = tx.send(OutputEvent::Data(chunk));
        }
        state.buffered_bytes = 0;

        if state.eof {
            let _ = tx.send(OutputEvent::Eof);
        } else {
            state.sink = Some(tx);
        }
        rx
    }

    /// Unbinds the current stream, returning unconsumed chunks to the front
    /// of the retained buffer.
    pub fn unbind(&self, mut rx: OutputReceiver) {
        let mut state = self.lock();
        state.sink = None;
        rx.close();

        let mut unconsumed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OutputEvent::Data(chunk) = event {
                unconsumed.push(chunk);
            }
        }
        for chunk in unconsumed.into_iter().rev() {
            state.buffered_bytes += chunk.len();
            state.buffer.push_front(chunk);
        }
        state.enforce_limit(self.limit);
    }

    /// Bytes currently retained for the next attach.
    pub fn buffered_len(&self) -> usize {
        self.lock().buffered_bytes
    }

    /// Whether the process closed this output.
    pub fn is_finished(&self) -> bool {
        self.lock().eof
    }
}
