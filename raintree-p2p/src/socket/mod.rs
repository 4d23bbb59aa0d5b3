//! Duplex socket over one stream connection.
//!
//! A socket owns a read loop and a write loop. The read loop turns frames
//! into [`Packet`]s and routes each either to the request waiting on its
//! nonce or to the shared sink. The write loop drains an accumulated write
//! buffer whenever it is signalled; concurrent `write` calls append whole
//! frames under a lock, so their bytes never interleave.
//!
//! ```text
//!   Closed ──open()──▶ Opening ──both loops started──▶ Open
//!     ▲                   │                              │
//!     └──── Closing ◀─────┴────── close() / error ◀──────┘
//! ```

pub mod request;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::peer::ConnectionDirection;
use crate::protocol::{Encoding, Frame, FrameCodec};

pub use request::RequestMap;

/// Initial read buffer; grows on demand up to the frame size.
const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// A decoded inbound frame and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Request nonce, 0 if no response is expected.
    pub nonce: u32,
    /// Frame body.
    pub data: Bytes,
    /// Remote address of the socket the frame arrived on.
    pub peer_addr: String,
    /// Whether the body is a protocol envelope.
    pub wrapped: bool,
    /// Advertised body encoding.
    pub encoding: Encoding,
    /// Error/end-of-stream marker.
    pub is_error: bool,
}

impl Packet {
    fn from_frame(frame: Frame, peer_addr: &str) -> Self {
        Self {
            nonce: frame.nonce,
            data: frame.body,
            peer_addr: peer_addr.to_string(),
            wrapped: frame.wrapped,
            encoding: frame.encoding,
            is_error: frame.is_error,
        }
    }
}

/// Lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Not connected. Initial and terminal state.
    Closed,
    /// Dialing or starting the loops.
    Opening,
    /// Both loops running.
    Open,
    /// Tearing down.
    Closing,
}

/// Any bidirectional byte stream a socket can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Establishes outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`.
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// How a socket obtains its stream.
pub enum Connect {
    /// Dial the socket's address.
    Dial(Arc<dyn Dialer>),
    /// Use a stream the listener already accepted.
    Accepted(BoxedStream),
}

impl fmt::Debug for Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connect::Dial(_) => write!(f, "Dial"),
            Connect::Accepted(_) => write!(f, "Accepted"),
        }
    }
}

/// Callback invoked on socket lifecycle transitions.
pub type SocketHook = Arc<dyn Fn(&Socket) + Send + Sync>;

/// What the owner of a socket supplies: where unsolicited packets go, the
/// shutdown signal shared by every socket, and optional lifecycle hooks.
#[derive(Clone)]
pub struct Runner {
    sink: mpsc::Sender<Packet>,
    shutdown: CancellationToken,
    on_opened: Option<SocketHook>,
    on_closed: Option<SocketHook>,
}

impl Runner {
    /// Create a runner feeding `sink` and observing `shutdown`.
    pub fn new(sink: mpsc::Sender<Packet>, shutdown: CancellationToken) -> Self {
        Self {
            sink,
            shutdown,
            on_opened: None,
            on_closed: None,
        }
    }

    /// Run `hook` once the stream is established, before the loops start.
    pub fn with_on_opened(mut self, hook: impl Fn(&Socket) + Send + Sync + 'static) -> Self {
        self.on_opened = Some(Arc::new(hook));
        self
    }

    /// Run `hook` once, when the socket reaches its terminal state.
    pub fn with_on_closed(mut self, hook: impl Fn(&Socket) + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(hook));
        self
    }

    /// The shared shutdown signal.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("on_opened", &self.on_opened.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}

/// Per-socket limits.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Largest frame body accepted or sent.
    pub max_body_length: usize,
    /// How long `request` waits for its response.
    pub request_timeout: Duration,
}

impl SocketOptions {
    /// Limits derived from the node configuration.
    pub fn from_config(config: &P2pConfig) -> Self {
        Self {
            max_body_length: config.max_body_length(),
            request_timeout: config.request_timeout(),
        }
    }
}

struct Shared {
    addr: String,
    direction: ConnectionDirection,
    options: SocketOptions,
    runner: Runner,
    state: watch::Sender<SocketState>,
    requests: RequestMap,
    write_buf: Mutex<BytesMut>,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    token: CancellationToken,
    closed: AtomicBool,
    error: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn transition(&self, from: SocketState, to: SocketState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Handle to one connection. Clones share the same connection.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("addr", &self.shared.addr)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Socket {
    /// Create a closed socket for `addr`.
    ///
    /// The socket's loops stop when either [`Socket::close`] is called or
    /// the runner's shutdown token is cancelled.
    pub fn new(
        addr: impl Into<String>,
        direction: ConnectionDirection,
        options: SocketOptions,
        runner: Runner,
    ) -> Self {
        let (state, _) = watch::channel(SocketState::Closed);
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let token = runner.shutdown.child_token();

        Self {
            shared: Arc::new(Shared {
                addr: addr.into(),
                direction,
                options,
                runner,
                state,
                requests: RequestMap::new(),
                write_buf: Mutex::new(BytesMut::new()),
                signal_tx,
                signal_rx: Mutex::new(Some(signal_rx)),
                token,
                closed: AtomicBool::new(false),
                error: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Remote address this socket talks to.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Who initiated the connection.
    pub fn direction(&self) -> ConnectionDirection {
        self.shared.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        *self.shared.state.borrow()
    }

    /// Whether both loops are running.
    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Whether `close` has run. A terminated socket cannot be reopened.
    pub fn is_terminated(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Last error that tore the socket down, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.requests.len()
    }

    /// Establish the stream and start both loops.
    ///
    /// Returns once both loops have started. A socket can be opened once.
    pub async fn open(&self, connect: Connect) -> P2pResult<()> {
        let shared = &self.shared;

        if shared.token.is_cancelled() {
            return Err(P2pError::SocketClosed {
                addr: shared.addr.clone(),
            });
        }
        if !shared.transition(SocketState::Closed, SocketState::Opening) {
            return Err(P2pError::SocketAlreadyOpen {
                addr: shared.addr.clone(),
            });
        }

        let stream = match connect {
            Connect::Accepted(stream) => stream,
            Connect::Dial(dialer) => {
                let dialed = tokio::select! {
                    biased;
                    _ = shared.token.cancelled() => Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "socket closed while dialing",
                    )),
                    dialed = dialer.dial(&shared.addr) => dialed,
                };
                match dialed {
                    Ok(stream) => stream,
                    Err(e) => {
                        let err = P2pError::from_io(e, &shared.addr);
                        self.fail(&err);
                        self.close();
                        return Err(err);
                    }
                }
            }
        };

        let signal_rx = shared.signal_rx.lock().take().ok_or_else(|| {
            P2pError::SocketAlreadyOpen {
                addr: shared.addr.clone(),
            }
        })?;

        let (reader, writer) = tokio::io::split(stream);

        if let Some(hook) = &shared.runner.on_opened {
            hook(self);
        }

        let (read_started_tx, read_started_rx) = oneshot::channel();
        let (write_started_tx, write_started_rx) = oneshot::channel();

        let read = tokio::spawn(self.clone().read_loop(reader, read_started_tx));
        let write = tokio::spawn(self.clone().write_loop(writer, signal_rx, write_started_tx));
        shared.tasks.lock().extend([read, write]);

        let _ = read_started_rx.await;
        let _ = write_started_rx.await;

        if !shared.transition(SocketState::Opening, SocketState::Open) {
            return Err(P2pError::SocketClosed {
                addr: shared.addr.clone(),
            });
        }

        tracing::debug!(
            addr = %shared.addr,
            direction = %shared.direction,
            "Socket opened"
        );
        Ok(())
    }

    /// Wait until the socket is open. Fails if it closes first.
    pub async fn ready(&self) -> P2pResult<()> {
        let mut state = self.shared.state.subscribe();
        let closed = || P2pError::SocketClosed {
            addr: self.shared.addr.clone(),
        };

        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(closed()),
            res = state.wait_for(|s| *s == SocketState::Open) => res.map(|_| ()).map_err(|_| closed()),
        }
    }

    /// Wait until the socket has fully closed.
    pub async fn closed(&self) {
        self.shared.token.cancelled().await;
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SocketState::Closed).await;
    }

    /// Queue a frame for the write loop. Never waits on the network.
    pub fn write(
        &self,
        body: impl Into<Bytes>,
        is_error: bool,
        nonce: u32,
        wrapped: bool,
    ) -> P2pResult<()> {
        let shared = &self.shared;
        if !self.is_open() {
            return Err(P2pError::SocketClosed {
                addr: shared.addr.clone(),
            });
        }

        let frame = Frame::new(nonce, body, wrapped).with_error(is_error);
        let len = frame.body.len();
        {
            let mut buf = shared.write_buf.lock();
            FrameCodec::new(shared.options.max_body_length).encode(frame, &mut buf)?;
        }

        match shared.signal_tx.try_send(()) {
            // A pending signal already covers this frame.
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(P2pError::SocketClosed {
                    addr: shared.addr.clone(),
                });
            }
        }

        tracing::trace!(addr = %shared.addr, nonce, len, wrapped, "Frame queued");
        Ok(())
    }

    /// Answer the request carrying `nonce`.
    pub fn respond(
        &self,
        nonce: u32,
        is_error: bool,
        body: impl Into<Bytes>,
        wrapped: bool,
    ) -> P2pResult<()> {
        self.write(body, is_error, nonce, wrapped)
    }

    /// Write a request and wait for its response, up to the configured timeout.
    pub async fn request(&self, body: impl Into<Bytes>, wrapped: bool) -> P2pResult<Packet> {
        self.request_within(body, wrapped, self.shared.options.request_timeout)
            .await
    }

    /// Write a request and wait for its response, up to `timeout`.
    pub async fn request_within(
        &self,
        body: impl Into<Bytes>,
        wrapped: bool,
        timeout: Duration,
    ) -> P2pResult<Packet> {
        let shared = &self.shared;
        let (nonce, response) = shared.requests.get();

        if let Err(e) = self.write(body, false, nonce, wrapped) {
            shared.requests.delete(nonce);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(P2pError::SocketClosed {
                addr: shared.addr.clone(),
            }),
            Err(_) => {
                shared.requests.delete(nonce);
                tracing::debug!(addr = %shared.addr, nonce, "Request timed out");
                Err(P2pError::RequestTimedOut {
                    addr: shared.addr.clone(),
                    nonce,
                })
            }
        }
    }

    /// Tear the socket down. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        shared.state.send_replace(SocketState::Closing);
        shared.token.cancel();
        shared.requests.clear();
        shared.write_buf.lock().clear();
        shared.state.send_replace(SocketState::Closed);

        if let Some(hook) = &shared.runner.on_closed {
            hook(self);
        }

        tracing::debug!(
            addr = %shared.addr,
            direction = %shared.direction,
            "Socket closed"
        );
        true
    }

    /// Wait for both loops to exit.
    pub async fn join(&self) {
        let tasks: Vec<_> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn fail(&self, err: &P2pError) {
        let shared = &self.shared;
        if err.is_hang_up() {
            tracing::debug!(addr = %shared.addr, "Peer hung up");
        } else {
            tracing::warn!(addr = %shared.addr, error = %err, "Socket error");
        }
        shared.error.lock().get_or_insert_with(|| err.to_string());
    }

    async fn read_loop(self, reader: ReadHalf<BoxedStream>, started: oneshot::Sender<()>) {
        let addr = self.shared.addr.clone();
        let codec = FrameCodec::new(self.shared.options.max_body_length);
        let mut frames = FramedRead::with_capacity(reader, codec, INITIAL_READ_CAPACITY);
        let _ = started.send(());

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.token.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => self.dispatch(Packet::from_frame(frame, &addr)).await,
                Some(Err(P2pError::Io(e))) => {
                    self.fail(&P2pError::from_io(e, &addr));
                    break;
                }
                Some(Err(err)) => {
                    self.fail(&err);
                    break;
                }
                None => {
                    self.fail(&P2pError::PeerHangUp { addr: addr.clone() });
                    break;
                }
            }
        }

        self.close();
    }

    async fn dispatch(&self, packet: Packet) {
        let shared = &self.shared;
        tracing::trace!(
            addr = %shared.addr,
            nonce = packet.nonce,
            len = packet.data.len(),
            wrapped = packet.wrapped,
            "Frame received"
        );

        if packet.nonce != 0 {
            if let Some(waiter) = shared.requests.find(packet.nonce) {
                if waiter.send(packet).is_err() {
                    tracing::trace!(addr = %shared.addr, "Requester went away before its response");
                }
                return;
            }
        }

        tokio::select! {
            biased;
            _ = shared.token.cancelled() => {}
            res = shared.runner.sink.send(packet) => {
                if res.is_err() {
                    tracing::debug!(addr = %shared.addr, "Sink closed, dropping packet");
                }
            }
        }
    }

    async fn write_loop(
        self,
        writer: WriteHalf<BoxedStream>,
        mut signal: mpsc::Receiver<()>,
        started: oneshot::Sender<()>,
    ) {
        let addr = self.shared.addr.clone();
        let mut writer = writer;
        let _ = started.send(());

        loop {
            tokio::select! {
                biased;
                _ = self.shared.token.cancelled() => break,
                signalled = signal.recv() => {
                    if signalled.is_none() {
                        break;
                    }
                }
            }

            let chunk = {
                let mut buf = self.shared.write_buf.lock();
                if buf.is_empty() {
                    continue;
                }
                buf.split().freeze()
            };

            // A peer that stops reading must not keep a closed socket alive.
            let flushed = tokio::select! {
                biased;
                _ = self.shared.token.cancelled() => break,
                flushed = flush_chunk(&mut writer, &chunk) => flushed,
            };
            if let Err(e) = flushed {
                self.fail(&P2pError::from_io(e, &addr));
                break;
            }
            tracing::trace!(addr = %addr, bytes = chunk.len(), "Flushed");
        }

        if !self.shared.token.is_cancelled() {
            let _ = writer.shutdown().await;
        }
        drop(writer);
        self.close();
    }
}

async fn flush_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Hands out a pre-built in-memory stream once.
    struct DuplexDialer(Mutex<Option<DuplexStream>>);

    #[async_trait]
    impl Dialer for DuplexDialer {
        async fn dial(&self, _addr: &str) -> io::Result<BoxedStream> {
            self.0
                .lock()
                .take()
                .map(|s| Box::new(s) as BoxedStream)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "used"))
        }
    }

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _addr: &str) -> io::Result<BoxedStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn options() -> SocketOptions {
        SocketOptions {
            max_body_length: 1024,
            request_timeout: Duration::from_millis(500),
        }
    }

    fn runner() -> (Runner, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(16);
        (Runner::new(tx, CancellationToken::new()), rx)
    }

    /// Outbound socket A dialed into inbound socket B over an in-memory pipe.
    async fn pair() -> (Socket, mpsc::Receiver<Packet>, Socket, mpsc::Receiver<Packet>) {
        let (a_end, b_end) = duplex(64 * 1024);
        let (runner_a, sink_a) = runner();
        let (runner_b, sink_b) = runner();

        let a = Socket::new("b", ConnectionDirection::Outbound, options(), runner_a);
        let b = Socket::new("a", ConnectionDirection::Inbound, options(), runner_b);

        let dialer = Arc::new(DuplexDialer(Mutex::new(Some(a_end))));
        a.open(Connect::Dial(dialer)).await.unwrap();
        b.open(Connect::Accepted(Box::new(b_end))).await.unwrap();

        (a, sink_a, b, sink_b)
    }

    #[tokio::test]
    async fn test_open_once() {
        let (a, _sa, b, _sb) = pair().await;
        assert!(a.is_open());
        assert!(b.is_open());
        a.ready().await.unwrap();

        let (_, other) = duplex(64);
        let err = a.open(Connect::Accepted(Box::new(other))).await.unwrap_err();
        assert!(matches!(err, P2pError::SocketAlreadyOpen { .. }));
    }

    #[tokio::test]
    async fn test_request_response() {
        let (a, _sa, b, mut sink_b) = pair().await;

        let responder = tokio::spawn(async move {
            let packet = sink_b.recv().await.unwrap();
            assert_ne!(packet.nonce, 0);
            assert_eq!(&packet.data[..], b"ping");
            b.respond(packet.nonce, false, &b"pong"[..], false).unwrap();
        });

        let reply = a.request(&b"ping"[..], false).await.unwrap();
        assert_eq!(&reply.data[..], b"pong");
        assert_eq!(a.pending_requests(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_frames_reach_sink_in_order() {
        let (a, mut sink_a, b, _sb) = pair().await;

        for i in 0..50u8 {
            b.write(vec![i; 3], false, 0, i % 2 == 0).unwrap();
        }
        for i in 0..50u8 {
            let packet = sink_a.recv().await.unwrap();
            assert_eq!(packet.nonce, 0);
            assert_eq!(&packet.data[..], &[i; 3]);
            assert_eq!(packet.wrapped, i % 2 == 0);
            assert_eq!(packet.peer_addr, "b");
        }
        drop(a);
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_up() {
        let (a, mut sink_a, b, mut sink_b) = pair().await;

        let err = a
            .request_within(&b"ping"[..], false, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::RequestTimedOut { .. }));
        assert_eq!(a.pending_requests(), 0);

        // The late response has no waiter and lands in the sink instead.
        let request = sink_b.recv().await.unwrap();
        b.respond(request.nonce, false, &b"late"[..], false).unwrap();
        let late = sink_a.recv().await.unwrap();
        assert_eq!(late.nonce, request.nonce);
        assert_eq!(&late.data[..], b"late");
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();

        let (a_end, _b_end) = duplex(1024);
        let (runner, _sink) = runner();
        let runner = runner.with_on_closed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let socket = Socket::new("peer", ConnectionDirection::Inbound, options(), runner);
        socket.open(Connect::Accepted(Box::new(a_end))).await.unwrap();

        assert!(socket.close());
        assert!(!socket.close());
        socket.closed().await;
        socket.join().await;

        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            socket.write(&b"x"[..], false, 0, false),
            Err(P2pError::SocketClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (a, _sa, _b, _sb) = pair().await;
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.request(&b"ping"[..], false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, P2pError::SocketClosed { .. }));
    }

    #[tokio::test]
    async fn test_peer_hang_up_closes_socket() {
        let (a, _sa, b, _sb) = pair().await;
        b.close();
        b.join().await;

        a.closed().await;
        assert_eq!(a.state(), SocketState::Closed);
        assert!(a.error().unwrap().contains("hung up"));
    }

    #[tokio::test]
    async fn test_framing_error_closes_socket() {
        let (mut raw, end) = duplex(1024);
        let (runner, _sink) = runner();
        let socket = Socket::new("peer", ConnectionDirection::Inbound, options(), runner);
        socket.open(Connect::Accepted(Box::new(end))).await.unwrap();

        raw.write_all(&[0xE0, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
        socket.closed().await;
        assert!(socket.error().unwrap().contains("invalid flag"));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (mut raw, end) = duplex(1024);
        let (runner, _sink) = runner();
        let socket = Socket::new("peer", ConnectionDirection::Inbound, options(), runner);
        socket.open(Connect::Accepted(Box::new(end))).await.unwrap();

        assert!(matches!(
            socket.write(vec![0u8; 2048], false, 0, false),
            Err(P2pError::BodyTooLarge { .. })
        ));

        let header = crate::protocol::wire::encode(Encoding::Binary, false, 0, &[], false);
        let mut bogus = header.to_vec();
        bogus[5..9].copy_from_slice(&4096u32.to_be_bytes());
        raw.write_all(&bogus).await.unwrap();

        socket.closed().await;
        assert!(socket.error().unwrap().contains("cannot read a buffer of length 4096"));
    }

    #[tokio::test]
    async fn test_frames_hit_the_wire() {
        let (mut raw, end) = duplex(1024);
        let (runner, _sink) = runner();
        let socket = Socket::new("peer", ConnectionDirection::Inbound, options(), runner);
        socket.open(Connect::Accepted(Box::new(end))).await.unwrap();

        socket.respond(7, true, &b"end"[..], true).unwrap();

        let mut wire = [0u8; 12];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], 0b0001_1100);
        assert_eq!(&wire[1..5], &7u32.to_be_bytes());
        assert_eq!(&wire[5..9], &3u32.to_be_bytes());
        assert_eq!(&wire[9..], b"end");
    }

    #[tokio::test]
    async fn test_close_with_stalled_peer() {
        // The far end never reads, so the pipe fills after 64 bytes.
        let (mut raw, end) = duplex(64);
        let (runner, _sink) = runner();
        let socket = Socket::new("peer", ConnectionDirection::Inbound, options(), runner);
        socket.open(Connect::Accepted(Box::new(end))).await.unwrap();

        for _ in 0..4 {
            socket.write(vec![7u8; 1000], false, 0, false).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(socket.close());
        let joined = tokio::time::timeout(Duration::from_secs(2), socket.join()).await;
        assert!(joined.is_ok(), "write loop should exit after close");

        // Both halves are gone, so the peer sees the stream end.
        let mut drained = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), raw.read_to_end(&mut drained)).await;
        assert!(read.is_ok());
        assert!(drained.len() < 4 * 1009);
    }

    #[tokio::test]
    async fn test_shutdown_cascades() {
        let (a, _sa, _b, _sb) = pair().await;
        a.shared.runner.shutdown().cancel();
        a.closed().await;
        assert!(!a.is_open());
    }

    #[tokio::test]
    async fn test_failed_dial_is_terminal() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let (runner, _sink) = runner();
        let runner = runner.with_on_opened(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let socket = Socket::new("nowhere", ConnectionDirection::Outbound, options(), runner);
        let err = socket.open(Connect::Dial(Arc::new(RefusingDialer))).await.unwrap_err();
        assert!(matches!(err, P2pError::Unexpected { .. }));
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert!(socket.ready().await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_ping_pong() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (runner_b, mut sink_b) = runner();
        let accept = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let b = Socket::new(remote.to_string(), ConnectionDirection::Inbound, options(), runner_b);
            b.open(Connect::Accepted(Box::new(stream))).await.unwrap();
            let packet = sink_b.recv().await.unwrap();
            assert_eq!(&packet.data[..], b"ping");
            b.respond(packet.nonce, false, &b"pong"[..], false).unwrap();
            b
        });

        let (runner_a, _sink_a) = runner();
        let a = Socket::new(addr, ConnectionDirection::Outbound, options(), runner_a);
        a.open(Connect::Dial(Arc::new(TcpDialer))).await.unwrap();

        let reply = a.request(&b"ping"[..], false).await.unwrap();
        assert_eq!(&reply.data[..], b"pong");

        let b = accept.await.unwrap();
        a.close();
        b.closed().await;
    }
}
