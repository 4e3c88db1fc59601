//! I/O pumps between a bound session and its protocol stream.
//!
//! Each open stream runs one [`pump_output`] per output direction and one
//! [`StdinSink`] for input. Output pumps stop when the process closes the
//! output or the stream is stopped; stopping one never stops another, so
//! half-close stays observable on the client.

use std::sync::Arc;

use protocol::messages::{StreamData, StreamEof};
use protocol::tty::{input_transcoder, output_transcoder};
use protocol::{DataStream, Message, Transcoder, MAX_CHUNK_SIZE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{OutputEvent, OutputReceiver, Session, SessionError};

/// Why an output pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The process closed the output; `StreamEof` was sent.
    Eof,
    /// The stream was stopped or the connection went away.
    Stopped,
}

/// Forwards one relay receiver to the client until EOF or `stop`.
///
/// Returns the receiver so the caller can hand unconsumed output back to
/// the session.
pub async fn pump_output(
    stream_id: u32,
    stream: DataStream,
    mut rx: OutputReceiver,
    tty: bool,
    outbound: mpsc::Sender<Message>,
    stop: CancellationToken,
) -> (PumpEnd, OutputReceiver) {
    let mut transcoder = output_transcoder(tty);
    let mut encoded = Vec::with_capacity(MAX_CHUNK_SIZE);

    loop {
        // Only the wait for output races `stop`; a received chunk is always sent.
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => return (PumpEnd::Stopped, rx),
            event = rx.recv() => event,
        };

        match event {
            Some(OutputEvent::Data(chunk)) => {
                encoded.clear();
                transcoder.transcode(&chunk, &mut encoded);
                if !send_chunks(stream_id, stream, &encoded, &outbound).await {
                    return (PumpEnd::Stopped, rx);
                }
            }
            Some(OutputEvent::Eof) | None => {
                encoded.clear();
                transcoder.flush(&mut encoded);
                if !send_chunks(stream_id, stream, &encoded, &outbound).await {
                    return (PumpEnd::Stopped, rx);
                }
                let eof = Message::StreamEof(StreamEof { stream_id, stream });
                if outbound.send(eof).await.is_err() {
                    return (PumpEnd::Stopped, rx);
                }
                tracing::debug!(stream_id = stream_id, stream = ?stream, "Output finished");
                return (PumpEnd::Eof, rx);
            }
        }
    }
}

async fn send_chunks(
    stream_id: u32,
    stream: DataStream,
    data: &[u8],
    outbound: &mpsc::Sender<Message>,
) -> bool {
    for piece in data.chunks(MAX_CHUNK_SIZE) {
        let message = Message::StreamData(StreamData {
            stream_id,
            stream,
            data: piece.to_vec(),
        });
        if outbound.send(message).await.is_err() {
            return false;
        }
    }
    true
}

/// Client input on its way to the process stdin.
pub struct StdinSink {
    session: Arc<Session>,
    transcoder: Box<dyn Transcoder>,
    scratch: Vec<u8>,
}

impl StdinSink {
    /// Creates a sink decoding terminal input when `tty` is set.
    pub fn new(session: Arc<Session>, tty: bool) -> Self {
        Self {
            session,
            transcoder: input_transcoder(tty),
            scratch: Vec::new(),
        }
    }

    /// Writes one chunk in arrival order.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.scratch.clear();
        self.transcoder.transcode(data, &mut self.scratch);
        if self.scratch.is_empty() {
            return Ok(());
        }
        self.session.write_stdin(&self.scratch).await
    }

    /// Writes any held-back bytes. Called when the stream lets go of stdin.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.scratch.clear();
        self.transcoder.flush(&mut self.scratch);
        if self.scratch.is_empty() {
            return Ok(());
        }
        self.session.write_stdin(&self.scratch).await
    }

    /// Flushes, then closes the process stdin.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.flush().await?;
        self.session.close_stdin().await
    }
}
