//! Host-side attach client.
//!
//! One reader task routes everything the server sends: replies go to the
//! request that is waiting on their `request_id`, stream traffic goes to
//! the [`Attached`] handles registered under its `stream_id`. One writer
//! task serialises everything the client sends, so stdin and control
//! requests reach the server in the order they were issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use protocol::messages::{
    ListSessions, OpenStream, Ping, SessionExited, SessionList, StreamClose, StreamData, StreamEof,
    StreamOpened,
};
use protocol::{AttachKey, DataStream, Message, SecureChannel, Transport};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::stream::{AttachStdin, Attached, ControlHandle, OutputReader, Outcome, StreamEnd};

/// Depth of the outbound message queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Where one stream's traffic is delivered.
struct Route {
    stdout: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stderr: Option<mpsc::UnboundedSender<Vec<u8>>>,
    exit_code: Option<Option<i32>>,
    end: watch::Sender<Option<Outcome>>,
}

impl Route {
    fn deliver(&mut self, stream: DataStream, data: Vec<u8>) {
        let sink = match stream {
            DataStream::Stdout => &self.stdout,
            DataStream::Stderr => &self.stderr,
            DataStream::Stdin => return,
        };
        if let Some(sink) = sink {
            // A dropped reader just discards its output.
            let _ = sink.send(data);
        }
    }

    fn finish(&mut self, stream: DataStream) {
        match stream {
            DataStream::Stdout => self.stdout = None,
            DataStream::Stderr => self.stderr = None,
            DataStream::Stdin => {}
        }
    }

    fn end(self, outcome: Outcome) {
        self.end.send_replace(Some(outcome));
    }
}

/// State shared between the client, its tasks and stream handles.
pub(crate) struct Inner {
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    routes: Mutex<HashMap<u32, Route>>,
    next_request: AtomicU64,
    next_stream: AtomicU32,
    closed: CancellationToken,
}

impl Inner {
    /// Sends a request and waits for the reply carrying its id.
    ///
    /// `opening` names the session when the request opens a stream; only
    /// then is an error reply rebuilt as an attach refusal.
    pub(crate) async fn request(
        &self,
        build: impl FnOnce(u64) -> Message,
        opening: Option<&str>,
    ) -> Result<Message, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);

        if self.closed.is_cancelled() || self.outbound.send(build(request_id)).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err(ClientError::Disconnected);
        }

        match rx.await.map_err(|_| ClientError::Disconnected)? {
            Message::Error(reply) => Err(match opening {
                Some(session_id) => ClientError::from_open_reply(reply, session_id),
                None => ClientError::from_reply(reply),
            }),
            reply => Ok(reply),
        }
    }

    /// Queues a message that has no reply.
    pub(crate) async fn send(&self, message: Message) -> Result<(), ClientError> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Disconnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::StreamData(StreamData {
                stream_id,
                stream,
                data,
            }) => self.with_route(stream_id, |route| route.deliver(stream, data)),
            Message::StreamEof(StreamEof { stream_id, stream }) => {
                self.with_route(stream_id, |route| route.finish(stream))
            }
            Message::SessionExited(SessionExited {
                stream_id,
                exit_code,
            }) => {
                tracing::debug!(stream_id = stream_id, exit_code = ?exit_code, "Session exited");
                self.with_route(stream_id, |route| route.exit_code = Some(exit_code))
            }
            Message::StreamClose(StreamClose { stream_id }) => {
                let route = self
                    .routes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&stream_id);
                if let Some(route) = route {
                    let end = match route.exit_code {
                        Some(code) => StreamEnd::Exited(code),
                        None => StreamEnd::Detached,
                    };
                    tracing::debug!(stream_id = stream_id, end = ?end, "Stream closed");
                    route.end(Outcome::Ended(end));
                }
            }
            Message::Error(ref reply) if reply.request_id.is_none() => {
                tracing::warn!(code = ?reply.code, message = %reply.message, "Server reported an error");
            }
            reply => match reply_id(&reply) {
                Some(request_id) => {
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&request_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(reply);
                        }
                        None => tracing::debug!(request_id = request_id, "Reply for unknown request"),
                    }
                }
                None => tracing::debug!(message = ?reply, "Unexpected message from server"),
            },
        }
    }

    fn with_route(&self, stream_id: u32, f: impl FnOnce(&mut Route)) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes.get_mut(&stream_id) {
            Some(route) => f(route),
            None => tracing::debug!(stream_id = stream_id, "Traffic for unknown stream dropped"),
        }
    }

    /// Fails every waiter and ends every stream.
    fn disconnect(&self) {
        self.closed.cancel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let routes: Vec<Route> = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, route)| route)
            .collect();
        for route in routes {
            route.end(Outcome::Disconnected);
        }
    }
}

fn reply_id(message: &Message) -> Option<u64> {
    match message {
        Message::SessionList(m) => Some(m.request_id),
        Message::StreamOpened(m) => Some(m.request_id),
        Message::ControlAck(m) => Some(m.request_id),
        Message::Pong(m) => Some(m.request_id),
        Message::Error(m) => m.request_id,
        _ => None,
    }
}

/// An authenticated connection to a guest's attach server.
pub struct AttachClient {
    inner: Arc<Inner>,
    channel: Arc<SecureChannel>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl AttachClient {
    /// Authenticates over an established transport.
    pub async fn connect(transport: Arc<dyn Transport>, key: &AttachKey) -> Result<Self, ClientError> {
        let channel = Arc::new(SecureChannel::initiate(transport, key).await?);
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let inner = Arc::new(Inner {
            outbound,
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            next_stream: AtomicU32::new(1),
            closed: CancellationToken::new(),
        });
        let reader = tokio::spawn(read_loop(channel.clone(), inner.clone()));
        let writer = tokio::spawn(write_loop(channel.clone(), rx, inner.clone()));
        tracing::debug!(key = %key.fingerprint(), "Attach client connected");

        Ok(Self {
            inner,
            channel,
            reader,
            writer,
        })
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    /// Lists every registered session id.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        match self
            .inner
            .request(|request_id| Message::ListSessions(ListSessions { request_id }), None)
            .await?
        {
            Message::SessionList(SessionList { session_ids, .. }) => Ok(session_ids),
            other => Err(ClientError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Checks the server is responsive.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self
            .inner
            .request(|request_id| Message::Ping(Ping { request_id }), None)
            .await?
        {
            Message::Pong(_) => Ok(()),
            other => Err(ClientError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Attaches to a session's live I/O.
    pub async fn attach(&self, session_id: &str) -> Result<Attached, ClientError> {
        self.open(session_id, false).await
    }

    /// Opens a session's buffered output, including after its process
    /// exited.
    pub async fn attach_logs(&self, session_id: &str) -> Result<Attached, ClientError> {
        self.open(session_id, true).await
    }

    async fn open(&self, session_id: &str, log_only: bool) -> Result<Attached, ClientError> {
        let stream_id = self.inner.next_stream.fetch_add(1, Ordering::SeqCst);
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = watch::channel(None);

        // Registered before the request so no early output is missed.
        self.inner
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                stream_id,
                Route {
                    stdout: Some(stdout_tx),
                    stderr: Some(stderr_tx),
                    exit_code: None,
                    end: end_tx,
                },
            );

        let reply = self
            .inner
            .request(
                |request_id| {
                    Message::OpenStream(OpenStream {
                        request_id,
                        stream_id,
                        session_id: session_id.to_string(),
                        log_only,
                    })
                },
                Some(session_id),
            )
            .await;

        let tty = match reply {
            Ok(Message::StreamOpened(StreamOpened { tty, .. })) => tty,
            Ok(other) => {
                self.drop_route(stream_id);
                return Err(ClientError::UnexpectedReply(format!("{:?}", other)));
            }
            Err(e) => {
                self.drop_route(stream_id);
                return Err(e);
            }
        };
        tracing::debug!(session_id = %session_id, stream_id = stream_id, tty = tty, "Attached");

        Ok(Attached {
            stdin: AttachStdin::new(stream_id, self.inner.outbound.clone(), tty),
            stdout: OutputReader::new(stdout_rx, tty),
            stderr: OutputReader::new(stderr_rx, tty),
            control: ControlHandle::new(
                self.inner.clone(),
                session_id.to_string(),
                stream_id,
                tty,
                end_rx,
            ),
        })
    }

    fn drop_route(&self, stream_id: u32) {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id);
    }

    /// Closes the connection. Attached sessions are detached by the server.
    pub async fn close(self) -> Result<(), ClientError> {
        self.inner.disconnect();
        self.channel.close().await?;
        Ok(())
    }
}

impl Drop for AttachClient {
    fn drop(&mut self) {
        self.inner.disconnect();
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for AttachClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn read_loop(channel: Arc<SecureChannel>, inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            message = channel.recv() => message,
            _ = inner.closed.cancelled() => break,
        };
        match message {
            Ok(message) => inner.dispatch(message),
            Err(e) if e.is_link_error() => {
                tracing::debug!(error = %e, "Attach server link closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from attach server");
                break;
            }
        }
    }
    inner.disconnect();
}

async fn write_loop(channel: Arc<SecureChannel>, mut rx: mpsc::Receiver<Message>, inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = inner.closed.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = channel.send(message).await {
            tracing::warn!(error = %e, "Failed to send to attach server");
            inner.disconnect();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::ControlAck;
    use protocol::{ErrorCode, ErrorMessage, HalfDuplexConn};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Connects a client to a scripted server channel.
    async fn pair() -> (AttachClient, SecureChannel) {
        let (host, guest) = HalfDuplexConn::memory_pair(64 * 1024);
        let key = AttachKey::generate();
        let host: Arc<dyn Transport> = Arc::new(host);
        let guest: Arc<dyn Transport> = Arc::new(guest);
        let (client, server) = tokio::join!(
            AttachClient::connect(host, &key),
            SecureChannel::accept(guest, &key)
        );
        (client.unwrap(), server.unwrap())
    }

    async fn expect_open(server: &SecureChannel) -> OpenStream {
        match server.recv().await.unwrap() {
            Message::OpenStream(open) => open,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list() {
        let (client, server) = pair().await;
        let (ids, ()) = tokio::join!(client.list(), async {
            let Message::ListSessions(ListSessions { request_id }) = server.recv().await.unwrap() else {
                panic!("expected list");
            };
            server
                .send(Message::SessionList(SessionList {
                    request_id,
                    session_ids: vec!["a".into(), "b".into()],
                }))
                .await
                .unwrap();
        });
        assert_eq!(ids.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_attach_refused_maps_error() {
        let (client, server) = pair().await;
        let (result, ()) = tokio::join!(client.attach("ghost"), async {
            let open = expect_open(&server).await;
            server
                .send(Message::Error(ErrorMessage {
                    request_id: Some(open.request_id),
                    code: ErrorCode::NoSuchSession,
                    message: "No such container: ghost".into(),
                    context: Some("ghost".into()),
                }))
                .await
                .unwrap();
        });
        let err = result.unwrap_err();
        assert!(err.is_no_such_session());
        assert_eq!(err.to_string(), "No such container: ghost");
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_stream_routing_and_exit() {
        let (client, server) = pair().await;
        let (attached, open) = tokio::join!(client.attach("web"), async {
            let open = expect_open(&server).await;
            server
                .send(Message::StreamOpened(StreamOpened {
                    request_id: open.request_id,
                    stream_id: open.stream_id,
                    tty: false,
                }))
                .await
                .unwrap();
            open
        });
        let mut attached = attached.unwrap();
        let stream_id = open.stream_id;

        attached.stdin.write_all(b"ping").await.unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            Message::StreamData(StreamData {
                stream_id,
                stream: DataStream::Stdin,
                data: b"ping".to_vec(),
            })
        );

        for message in [
            Message::StreamData(StreamData {
                stream_id,
                stream: DataStream::Stdout,
                data: b"out".to_vec(),
            }),
            Message::StreamData(StreamData {
                stream_id,
                stream: DataStream::Stderr,
                data: b"err".to_vec(),
            }),
            Message::StreamEof(StreamEof {
                stream_id,
                stream: DataStream::Stdout,
            }),
            Message::StreamEof(StreamEof {
                stream_id,
                stream: DataStream::Stderr,
            }),
            Message::SessionExited(SessionExited {
                stream_id,
                exit_code: Some(3),
            }),
            Message::StreamClose(StreamClose { stream_id }),
        ] {
            server.send(message).await.unwrap();
        }

        let mut out = Vec::new();
        attached.stdout.read_to_end(&mut out).await.unwrap();
        let mut err = Vec::new();
        attached.stderr.read_to_end(&mut err).await.unwrap();
        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
        assert_eq!(attached.control.wait().await.unwrap(), StreamEnd::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_control_requests_are_acknowledged() {
        let (client, server) = pair().await;
        let (attached, open) = tokio::join!(client.attach("web"), async {
            let open = expect_open(&server).await;
            server
                .send(Message::StreamOpened(StreamOpened {
                    request_id: open.request_id,
                    stream_id: open.stream_id,
                    tty: true,
                }))
                .await
                .unwrap();
            open
        });
        let attached = attached.unwrap();
        assert!(attached.control.is_tty());

        let (resized, ()) = tokio::join!(attached.control.resize(120, 40), async {
            match server.recv().await.unwrap() {
                Message::Resize(resize) => {
                    assert_eq!(resize.stream_id, open.stream_id);
                    assert_eq!((resize.cols, resize.rows), (120, 40));
                    server
                        .send(Message::ControlAck(ControlAck {
                            request_id: resize.request_id,
                        }))
                        .await
                        .unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        });
        resized.unwrap();

        let (signalled, ()) = tokio::join!(attached.control.signal("BOGUS"), async {
            let Message::Signal(signal) = server.recv().await.unwrap() else {
                panic!("expected signal");
            };
            server
                .send(Message::Error(ErrorMessage {
                    request_id: Some(signal.request_id),
                    code: ErrorCode::InvalidSignal,
                    message: "invalid signal: BOGUS".into(),
                    context: Some("web".into()),
                }))
                .await
                .unwrap();
        });
        assert!(matches!(
            signalled,
            Err(ClientError::Rejected {
                code: ErrorCode::InvalidSignal,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_waiters() {
        let (client, server) = pair().await;
        let (attached, ()) = tokio::join!(client.attach("web"), async {
            let open = expect_open(&server).await;
            server
                .send(Message::StreamOpened(StreamOpened {
                    request_id: open.request_id,
                    stream_id: open.stream_id,
                    tty: false,
                }))
                .await
                .unwrap();
        });
        let mut attached = attached.unwrap();

        server.close().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), attached.control.wait())
            .await
            .unwrap();
        assert!(matches!(end, Err(ClientError::Disconnected)));

        let mut out = Vec::new();
        attached.stdout.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert!(matches!(client.list().await, Err(ClientError::Disconnected)));
        assert!(!client.is_connected());
    }
}
