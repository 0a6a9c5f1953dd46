//! Connection State Machine
//!
//! Each accepted connection is driven by its own async task, which is the
//! only place the connection's socket, buffer and timer are ever touched.
//! The task reads newline-delimited text, re-arms an idle timer after every
//! complete line, and exits through exactly one of three terminal paths.
//!
//! ## Lifecycle
//!
//! ```text
//!                    run()
//!    ┌─────────┐            ┌─────────┐
//!    │ Created │───────────>│ Running │<────────────┐
//!    └─────────┘            └────┬────┘             │ line received
//!                                │                  │ (timer re-armed)
//!                                ├──────────────────┘
//!                                │
//!              ┌─────────────────┼──────────────────┐
//!              │                 │                  │
//!        idle timer        read error /       notify_cancel()
//!         expires          peer closed              │
//!              │                 │            ┌─────▼────────┐
//!              │                 │            │ ShuttingDown │
//!              │                 │            └─────┬────────┘
//!              ▼                 ▼                  ▼
//!         ┌─────────────────────────────────────────────┐
//!         │         Closed(TimedOut | ReadFailed |      │
//!         │                Cancelled)                   │
//!         └─────────────────────────────────────────────┘
//! ```
//!
//! ## Cancellation
//!
//! Timeout, explicit shutdown and read failure all end the connection, and
//! all three converge on a single teardown path that shuts the socket down
//! once. The close reason is determined by which `select!` branch fired,
//! so there is never any ambiguity about why a connection ended.
//!
//! ## Ownership
//!
//! The spawned task owns the [`Connection`] and holds the only strong
//! reference to its [`ConnectionHandle`]; the manager's registry holds a
//! `Weak` so that bookkeeping never extends a connection's lifetime.

use crate::connection::settings::ConnectionSettings;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, error, info, trace};

/// Hard cap on buffered bytes while waiting for a line terminator (64 KB).
///
/// A peer that streams data without ever sending `\n` would otherwise grow
/// the read buffer without bound; hitting the cap is a fatal transport error
/// for that connection.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Identity of a connection within the manager's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection reached `Closed`.
///
/// Exactly one reason is produced per connection, by whichever exit path
/// fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The idle timer expired with no complete line in between.
    TimedOut,
    /// The transport failed: read error, reset, or the peer closed the stream.
    ReadFailed,
    /// The manager (or another external party) asked the connection to stop.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TimedOut => write!(f, "timed out"),
            CloseReason::ReadFailed => write!(f, "read failed"),
            CloseReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Observable lifecycle state of a connection.
///
/// Published through a `watch` channel; `ShuttingDown` is only entered on
/// the explicit-cancel path, mirroring the fact that timeout and read
/// failure terminate the read loop directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    ShuttingDown,
    Closed(CloseReason),
}

/// Errors that can terminate a connection's read loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error on the transport
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed its end of the stream
    #[error("peer closed the connection")]
    PeerClosed,

    /// The buffer filled up without a line terminator arriving
    #[error("line exceeded {} buffered bytes without a terminator", MAX_LINE_BYTES)]
    LineTooLong,
}

/// Server-wide connection statistics, shared across all connections and the
/// manager.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total complete lines received
    pub lines_received: AtomicU64,
    /// Total bytes read off the wire
    pub bytes_read: AtomicU64,
    /// Connections closed because their idle timer expired
    pub closed_timed_out: AtomicU64,
    /// Connections closed because of a transport failure
    pub closed_read_failed: AtomicU64,
    /// Connections closed by explicit cancellation
    pub closed_cancelled: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records a terminal transition; called by the manager when it erases
    /// the connection's registry entry.
    pub fn record_close(&self, reason: CloseReason) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        let counter = match reason {
            CloseReason::TimedOut => &self.closed_timed_out,
            CloseReason::ReadFailed => &self.closed_read_failed,
            CloseReason::Cancelled => &self.closed_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The manager-facing surface of a live connection.
///
/// The registry stores these behind `Weak` references: resolving a handle
/// whose connection has already finished is a normal outcome, not an error.
/// `notify_cancel` is an asynchronous message send; the cancellation is
/// observed by the connection's own task, never executed on the caller's
/// stack.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<LifecycleState>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        cancel_tx: watch::Sender<bool>,
        state_rx: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            id,
            peer,
            cancel_tx,
            state_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes lifecycle transitions as they happen.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    /// Asks the connection to shut down.
    ///
    /// Returns immediately; the connection tears itself down on its own
    /// task. Calling this more than once, or after the connection has
    /// already finished, is harmless.
    pub fn notify_cancel(&self) {
        trace!(id = %self.id, client = %self.peer, "cancel requested");
        let _ = self.cancel_tx.send(true);
    }
}

/// What the read loop should do next, decided by whichever event fired.
enum LoopStep {
    Data(usize),
    PeerClosed,
    Failed(std::io::Error),
    TimedOut,
    Cancelled,
}

/// One accepted connection: the socket, its read buffer, its settings and
/// its lifecycle state, all owned and mutated exclusively by the task that
/// runs [`Connection::run`].
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
    settings: ConnectionSettings,
    state_tx: watch::Sender<LifecycleState>,
    cancel_rx: watch::Receiver<bool>,
    stats: Arc<ConnectionStats>,
}

impl Connection {
    /// Wraps an accepted stream in a connection and returns it together
    /// with the handle the manager keeps (weakly) in its registry.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        settings: ConnectionSettings,
        stats: Arc<ConnectionStats>,
    ) -> (Self, Arc<ConnectionHandle>) {
        let (state_tx, state_rx) = watch::channel(LifecycleState::Created);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = Arc::new(ConnectionHandle::new(id, peer, cancel_tx, state_rx));
        let connection = Self {
            id,
            stream,
            peer,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            settings,
            state_tx,
            cancel_rx,
            stats,
        };
        (connection, handle)
    }

    /// Drives the connection until it times out, fails, or is cancelled.
    ///
    /// Returns the single terminal reason. The socket is shut down and the
    /// `Closed` state published before this returns, regardless of which
    /// exit path fired.
    pub async fn run(mut self) -> CloseReason {
        self.transition(LifecycleState::Running);
        info!(
            id = %self.id,
            client = %self.peer,
            settings = %self.settings,
            "connection started"
        );

        let idle = sleep(Duration::ZERO);
        tokio::pin!(idle);
        self.poke_timer(idle.as_mut());

        let reason = self.read_loop(idle).await;

        // Single teardown path for all three exits.
        let _ = self.stream.shutdown().await;
        self.transition(LifecycleState::Closed(reason));
        debug!(id = %self.id, client = %self.peer, reason = %reason, "connection closed");
        reason
    }

    async fn read_loop(&mut self, mut idle: Pin<&mut Sleep>) -> CloseReason {
        loop {
            // Consume at most one buffered line per cycle; anything after
            // the terminator stays buffered for the next pass.
            if let Some(line) = split_line(&mut self.buffer) {
                self.stats.line_received();
                info!(
                    id = %self.id,
                    client = %self.peer,
                    line = %String::from_utf8_lossy(&line),
                    "received"
                );
                self.poke_timer(idle.as_mut());
                continue;
            }

            if self.buffer.len() >= MAX_LINE_BYTES {
                error!(
                    id = %self.id,
                    client = %self.peer,
                    buffered = self.buffer.len(),
                    error = %ConnectionError::LineTooLong,
                    "read error"
                );
                return CloseReason::ReadFailed;
            }

            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(4096);
            }

            let timeout_enabled = self.settings.should_timeout();
            let step = {
                let stream = &mut self.stream;
                let buffer = &mut self.buffer;
                let cancel_rx = &mut self.cancel_rx;
                tokio::select! {
                    _ = cancel_rx.changed() => LoopStep::Cancelled,
                    _ = idle.as_mut(), if timeout_enabled => LoopStep::TimedOut,
                    res = stream.read_buf(buffer) => match res {
                        Ok(0) => LoopStep::PeerClosed,
                        Ok(n) => LoopStep::Data(n),
                        Err(e) => LoopStep::Failed(e),
                    },
                }
            };

            match step {
                LoopStep::Data(n) => {
                    self.stats.bytes_read(n);
                    trace!(id = %self.id, client = %self.peer, bytes = n, "read data");
                }
                LoopStep::PeerClosed => {
                    debug!(
                        id = %self.id,
                        client = %self.peer,
                        error = %ConnectionError::PeerClosed,
                        "peer closed connection"
                    );
                    return CloseReason::ReadFailed;
                }
                LoopStep::Failed(e) => {
                    error!(
                        id = %self.id,
                        client = %self.peer,
                        error = %ConnectionError::Io(e),
                        "read error"
                    );
                    return CloseReason::ReadFailed;
                }
                LoopStep::TimedOut => {
                    info!(id = %self.id, client = %self.peer, "connection timeout");
                    return CloseReason::TimedOut;
                }
                LoopStep::Cancelled => {
                    self.transition(LifecycleState::ShuttingDown);
                    info!(id = %self.id, client = %self.peer, "connection cancelled - shutting down");
                    return CloseReason::Cancelled;
                }
            }
        }
    }

    /// Re-arms the idle deadline, if timeouts are enabled for this
    /// connection. Called once at start and again after every complete line.
    fn poke_timer(&self, idle: Pin<&mut Sleep>) {
        if self.settings.should_timeout() {
            idle.reset(Instant::now() + self.settings.inactivity_timeout());
        }
    }

    fn transition(&self, state: LifecycleState) {
        trace!(id = %self.id, state = ?state, "lifecycle transition");
        let _ = self.state_tx.send(state);
    }
}

/// Splits one complete line off the front of `buf`.
///
/// The terminator (and a preceding `\r`, if any) is removed from the
/// returned line; bytes after the terminator stay in the buffer. Returns
/// `None` when no terminator is present yet.
fn split_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(line.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn bytes_mut(data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn split_line_consumes_one_line_per_call() {
        let mut buf = bytes_mut(b"first\nsecond\npartial");
        assert_eq!(split_line(&mut buf).unwrap(), Bytes::from_static(b"first"));
        assert_eq!(split_line(&mut buf).unwrap(), Bytes::from_static(b"second"));
        assert!(split_line(&mut buf).is_none());
        assert_eq!(&buf[..], b"partial");
    }

    #[test]
    fn split_line_strips_crlf() {
        let mut buf = bytes_mut(b"hello\r\n");
        assert_eq!(split_line(&mut buf).unwrap(), Bytes::from_static(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn split_line_handles_empty_lines() {
        let mut buf = bytes_mut(b"\n\n");
        assert_eq!(split_line(&mut buf).unwrap(), Bytes::new());
        assert_eq!(split_line(&mut buf).unwrap(), Bytes::new());
        assert!(split_line(&mut buf).is_none());
    }

    async fn connected_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (stream, peer, client)
    }

    fn spawn_connection(
        stream: TcpStream,
        peer: SocketAddr,
        settings: ConnectionSettings,
    ) -> (
        Arc<ConnectionHandle>,
        JoinHandle<CloseReason>,
        Arc<ConnectionStats>,
    ) {
        let stats = Arc::new(ConnectionStats::new());
        let (connection, handle) = Connection::new(
            ConnectionId::new(1),
            stream,
            peer,
            settings,
            Arc::clone(&stats),
        );
        let join = tokio::spawn(connection.run());
        (handle, join, stats)
    }

    #[tokio::test]
    async fn receives_lines_and_fails_on_disconnect() {
        let (stream, peer, mut client) = connected_pair().await;
        let (handle, join, stats) = spawn_connection(stream, peer, ConnectionSettings::default());

        client.write_all(b"hello\nworld\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.lines_received.load(Ordering::Relaxed), 2);

        drop(client);
        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::ReadFailed);
        assert_eq!(
            handle.state(),
            LifecycleState::Closed(CloseReason::ReadFailed)
        );
    }

    #[tokio::test]
    async fn partial_line_stays_buffered() {
        let (stream, peer, mut client) = connected_pair().await;
        let (_handle, join, stats) = spawn_connection(stream, peer, ConnectionSettings::default());

        client.write_all(b"no terminator yet").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.lines_received.load(Ordering::Relaxed), 0);

        client.write_all(b"\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.lines_received.load(Ordering::Relaxed), 1);

        drop(client);
        let _ = timeout(Duration::from_secs(2), join).await.unwrap();
    }

    #[tokio::test]
    async fn times_out_when_idle() {
        let (stream, peer, mut client) = connected_pair().await;
        let settings = ConnectionSettings::new(Duration::from_millis(100));
        let (handle, join, _stats) = spawn_connection(stream, peer, settings);

        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::TimedOut);
        assert_eq!(
            handle.state(),
            LifecycleState::Closed(CloseReason::TimedOut)
        );

        // Socket was shut down: the client sees end of stream.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn line_resets_idle_timer() {
        let (stream, peer, mut client) = connected_pair().await;
        let settings = ConnectionSettings::new(Duration::from_millis(400));
        let (_handle, join, _stats) = spawn_connection(stream, peer, settings);

        tokio::time::sleep(Duration::from_millis(250)).await;
        client.write_all(b"still here\n").await.unwrap();

        // The original deadline would have fired at 400ms; the line pushed
        // it out, so the connection must still be running at 500ms.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!join.is_finished());

        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::TimedOut);
    }

    #[tokio::test]
    async fn zero_timeout_never_fires() {
        let (stream, peer, _client) = connected_pair().await;
        let (handle, join, _stats) =
            spawn_connection(stream, peer, ConnectionSettings::new(Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!join.is_finished());
        assert_eq!(handle.state(), LifecycleState::Running);

        handle.notify_cancel();
        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Cancelled);
    }

    #[tokio::test]
    async fn cancel_is_observed_on_connection_task() {
        let (stream, peer, _client) = connected_pair().await;
        let (handle, join, _stats) = spawn_connection(stream, peer, ConnectionSettings::default());

        handle.notify_cancel();
        // Cancelling twice is a no-op.
        handle.notify_cancel();

        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Cancelled);
        assert_eq!(
            handle.state(),
            LifecycleState::Closed(CloseReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn oversized_line_is_fatal() {
        let (stream, peer, mut client) = connected_pair().await;
        let (handle, join, _stats) = spawn_connection(stream, peer, ConnectionSettings::default());

        let blob = vec![b'a'; MAX_LINE_BYTES + 8 * 1024];
        client.write_all(&blob).await.unwrap();

        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::ReadFailed);
        assert_eq!(
            handle.state(),
            LifecycleState::Closed(CloseReason::ReadFailed)
        );
    }

    #[tokio::test]
    async fn exactly_one_terminal_reason() {
        // Race a cancellation against a disconnect; whichever wins, run()
        // must report exactly one reason and the final state must agree.
        let (stream, peer, client) = connected_pair().await;
        let (handle, join, _stats) = spawn_connection(stream, peer, ConnectionSettings::default());

        handle.notify_cancel();
        drop(client);

        let reason = timeout(Duration::from_secs(2), join).await.unwrap().unwrap();
        assert!(matches!(
            reason,
            CloseReason::Cancelled | CloseReason::ReadFailed
        ));
        assert_eq!(handle.state(), LifecycleState::Closed(reason));
    }
}
