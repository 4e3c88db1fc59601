//! Handles for one attached stream.
//!
//! [`Attached`] splits a stream into an [`AttachStdin`] writer, two
//! [`OutputReader`]s and a [`ControlHandle`]. TTY streams are transcoded
//! here so callers see the process's raw bytes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use protocol::messages::{CloseStdin, ResizeRequest, SignalRequest, StreamClose, StreamData, StreamEof};
use protocol::{DataStream, EscapeDecoder, EscapeEncoder, Message, Passthrough, Transcoder, MAX_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::PollSender;

use crate::client::Inner;
use crate::error::ClientError;

/// How an attached stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The stream was released; the process keeps running.
    Detached,
    /// The process exited with the given code (`None` if killed by a
    /// signal or never started).
    Exited(Option<i32>),
}

/// Terminal state published to [`ControlHandle::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ended(StreamEnd),
    Disconnected,
}

/// A stream bound to one session.
pub struct Attached {
    /// Input for the process. Shutting it down detaches.
    pub stdin: AttachStdin,
    /// Process stdout.
    pub stdout: OutputReader,
    /// Process stderr. Empty for TTY sessions.
    pub stderr: OutputReader,
    /// Resize, signal and lifecycle operations.
    pub control: ControlHandle,
}

impl std::fmt::Debug for Attached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attached")
            .field("session_id", &self.control.session_id)
            .field("stream_id", &self.control.stream_id)
            .field("tty", &self.control.tty)
            .finish()
    }
}

/// Process output as an [`AsyncRead`].
///
/// Reaches end-of-file when the process closes the output or the stream
/// ends.
pub struct OutputReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: Box<dyn Transcoder>,
    buffer: Vec<u8>,
    pos: usize,
    done: bool,
}

impl OutputReader {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>, tty: bool) -> Self {
        let decoder: Box<dyn Transcoder> = if tty {
            Box::new(EscapeDecoder::default())
        } else {
            Box::new(Passthrough)
        };
        Self {
            rx,
            decoder,
            buffer: Vec::new(),
            pos: 0,
            done: false,
        }
    }
}

impl AsyncRead for OutputReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.buffer.len() {
                let n = buf.remaining().min(this.buffer.len() - this.pos);
                buf.put_slice(&this.buffer[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            this.buffer.clear();
            this.pos = 0;
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.decoder.transcode(&chunk, &mut this.buffer),
                None => {
                    this.done = true;
                    this.decoder.flush(&mut this.buffer);
                }
            }
        }
    }
}

/// Process input as an [`AsyncWrite`].
///
/// `shutdown` sends end-of-stdin, which the server treats as a detach.
/// To close the process's stdin without detaching use
/// [`ControlHandle::close_stdin`].
pub struct AttachStdin {
    stream_id: u32,
    sender: PollSender<Message>,
    encoder: Box<dyn Transcoder>,
    scratch: Vec<u8>,
    shut: bool,
}

impl AttachStdin {
    pub(crate) fn new(stream_id: u32, outbound: mpsc::Sender<Message>, tty: bool) -> Self {
        let encoder: Box<dyn Transcoder> = if tty {
            Box::new(EscapeEncoder)
        } else {
            Box::new(Passthrough)
        };
        Self {
            stream_id,
            sender: PollSender::new(outbound),
            encoder,
            scratch: Vec::new(),
            shut: false,
        }
    }

    fn broken() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "attach connection closed")
    }
}

impl AsyncWrite for AttachStdin {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shut {
            return Poll::Ready(Err(Self::broken()));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| Self::broken())?;

        // Worst case the encoder doubles the input.
        let n = data.len().min(MAX_CHUNK_SIZE / 2);
        this.scratch.clear();
        this.encoder.transcode(&data[..n], &mut this.scratch);
        let message = Message::StreamData(StreamData {
            stream_id: this.stream_id,
            stream: DataStream::Stdin,
            data: std::mem::take(&mut this.scratch),
        });
        this.sender.send_item(message).map_err(|_| Self::broken())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shut {
            return Poll::Ready(Ok(()));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| Self::broken())?;
        let message = Message::StreamEof(StreamEof {
            stream_id: this.stream_id,
            stream: DataStream::Stdin,
        });
        this.sender.send_item(message).map_err(|_| Self::broken())?;
        this.shut = true;
        this.sender.close();
        Poll::Ready(Ok(()))
    }
}

/// Control operations scoped to one stream.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<Inner>,
    pub(crate) session_id: String,
    pub(crate) stream_id: u32,
    pub(crate) tty: bool,
    end: watch::Receiver<Option<Outcome>>,
}

impl ControlHandle {
    pub(crate) fn new(
        inner: Arc<Inner>,
        session_id: String,
        stream_id: u32,
        tty: bool,
        end: watch::Receiver<Option<Outcome>>,
    ) -> Self {
        Self {
            inner,
            session_id,
            stream_id,
            tty,
            end,
        }
    }

    /// The attached session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the session runs on a pseudo-terminal.
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Resizes the session's terminal. Returns once the server applied it.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ClientError> {
        let stream_id = self.stream_id;
        self.acked(|request_id| {
            Message::Resize(ResizeRequest {
                request_id,
                stream_id,
                cols,
                rows,
            })
        })
        .await
    }

    /// Delivers a signal by name (`"HUP"`, `"SIGTERM"` or a number).
    pub async fn signal(&self, name: &str) -> Result<(), ClientError> {
        let stream_id = self.stream_id;
        let name = name.to_string();
        self.acked(move |request_id| {
            Message::Signal(SignalRequest {
                request_id,
                stream_id,
                name,
            })
        })
        .await
    }

    /// Closes the process's stdin while staying attached.
    pub async fn close_stdin(&self) -> Result<(), ClientError> {
        let stream_id = self.stream_id;
        self.acked(|request_id| {
            Message::CloseStdin(CloseStdin {
                request_id,
                stream_id,
            })
        })
        .await
    }

    /// Detaches by ending stdin, then waits for the stream to close.
    pub async fn detach(&self) -> Result<StreamEnd, ClientError> {
        self.inner
            .send(Message::StreamEof(StreamEof {
                stream_id: self.stream_id,
                stream: DataStream::Stdin,
            }))
            .await?;
        self.wait().await
    }

    /// Drops the whole stream, then waits for the server to release it.
    /// The process keeps running.
    pub async fn close(&self) -> Result<StreamEnd, ClientError> {
        self.inner
            .send(Message::StreamClose(StreamClose {
                stream_id: self.stream_id,
            }))
            .await?;
        self.wait().await
    }

    /// Waits until the server closes the stream.
    pub async fn wait(&self) -> Result<StreamEnd, ClientError> {
        let mut end = self.end.clone();
        loop {
            if let Some(outcome) = *end.borrow_and_update() {
                return match outcome {
                    Outcome::Ended(end) => Ok(end),
                    Outcome::Disconnected => Err(ClientError::Disconnected),
                };
            }
            if end.changed().await.is_err() {
                return match *end.borrow() {
                    Some(Outcome::Ended(end)) => Ok(end),
                    _ => Err(ClientError::Disconnected),
                };
            }
        }
    }

    async fn acked(&self, build: impl FnOnce(u64) -> Message) -> Result<(), ClientError> {
        match self.inner.request(build, None).await? {
            Message::ControlAck(_) => Ok(()),
            other => Err(ClientError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("tty", &self.tty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_output_reader_decodes_split_escape() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = OutputReader::new(rx, true);
        tx.send(b"a^".to_vec()).unwrap();
        tx.send(b"[b^^".to_vec()).unwrap();
        drop(tx);

        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"a\x1bb^");
    }

    #[tokio::test]
    async fn test_output_reader_small_reads() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = OutputReader::new(rx, false);
        tx.send(b"hello".to_vec()).unwrap();
        drop(tx);

        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"he");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"llo");
    }

    #[tokio::test]
    async fn test_stdin_encodes_and_detaches_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut stdin = AttachStdin::new(4, tx, true);
        stdin.write_all(b"\x1b^").await.unwrap();
        stdin.shutdown().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Message::StreamData(StreamData {
                stream_id: 4,
                stream: DataStream::Stdin,
                data: b"^[^^".to_vec(),
            })
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Message::StreamEof(StreamEof {
                stream_id: 4,
                stream: DataStream::Stdin,
            })
        );
        assert!(stdin.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_stdin_splits_large_writes() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut stdin = AttachStdin::new(1, tx, false);
        let payload = vec![7u8; MAX_CHUNK_SIZE * 2];
        stdin.write_all(&payload).await.unwrap();
        drop(stdin);

        let mut total = 0;
        while let Some(message) = rx.recv().await {
            if let Message::StreamData(data) = message {
                assert!(data.data.len() <= MAX_CHUNK_SIZE);
                total += data.data.len();
            }
        }
        assert_eq!(total, payload.len());
    }
}
