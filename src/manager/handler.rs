//! Connection Manager
//!
//! The manager owns the listening socket and the accept loop, registers
//! every accepted connection in the [`Registry`](super::registry::Registry),
//! fans cancellation out to all live connections on shutdown, and erases
//! registry entries as connections report their own teardown.
//!
//! All registry mutation happens on the manager's task. The accept loop,
//! the external cancel signal and the teardown notifications are joined in
//! a single `select!`, so insertion, erasure and the cancellation snapshot
//! are naturally serialized.

use crate::connection::{
    CloseReason, Connection, ConnectionId, ConnectionSettings, ConnectionStats,
};
use crate::manager::registry::Registry;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Listen backlog for the accept queue
const LISTEN_BACKLOG: u32 = 1024;

/// Configuration for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interface to bind (default: all interfaces)
    pub host: Ipv4Addr,
    /// Port to listen on (default: 4000); 0 picks an ephemeral port
    pub port: u16,
    /// Inactivity timeout applied to every accepted connection;
    /// `Duration::ZERO` disables it
    pub inactivity_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: crate::DEFAULT_PORT,
            inactivity_timeout: Duration::ZERO,
        }
    }
}

/// Messages delivered to the manager task.
#[derive(Debug)]
enum ManagerEvent {
    /// A connection's task has finished; its registry entry can be erased.
    ConnectionClosed { id: ConnectionId, reason: CloseReason },
}

/// What the manager loop should do next, decided by whichever event fired.
enum Step {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Cancel,
    Event(ManagerEvent),
}

/// Handle to a running [`ConnectionManager`].
///
/// Dropping the handle without calling [`cancel`](ManagerHandle::cancel)
/// also shuts the manager down, since the cancel channel closes.
#[derive(Debug)]
pub struct ManagerHandle {
    local_addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ManagerHandle {
    /// The address the manager is actually listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared connection statistics.
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Stops new accepts and asks every live connection to cancel itself.
    ///
    /// Returns immediately; connections drain at their own pace. Safe to
    /// call more than once.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Waits for the manager task to finish draining.
    pub async fn wait(self) {
        let _ = self.task.await;
    }

    /// Convenience: cancel, then wait for all connections to close.
    pub async fn shutdown(self) {
        self.cancel();
        self.wait().await;
    }
}

/// Owns the listener, the registry and the settings template, and drives
/// the accept loop on its own task.
#[derive(Debug)]
pub struct ConnectionManager {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    settings_template: ConnectionSettings,
    registry: Registry,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    stats: Arc<ConnectionStats>,
    next_id: u64,
    shutting_down: bool,
}

impl ConnectionManager {
    /// Binds and listens on the configured endpoint with `reuse_address`
    /// enabled.
    ///
    /// A bind or listen failure is fatal and surfaces to the caller; it is
    /// never retried. Must be called from within a Tokio runtime.
    pub fn bind(config: ManagerConfig) -> io::Result<Self> {
        let addr = SocketAddr::from((config.host, config.port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!(addr = %local_addr, "listening");

        Ok(Self {
            listener: Some(listener),
            local_addr,
            settings_template: ConnectionSettings::new(config.inactivity_timeout),
            registry: Registry::new(),
            events_tx,
            events_rx,
            stats: Arc::new(ConnectionStats::new()),
            next_id: 0,
            shutting_down: false,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the manager task and returns a handle to it.
    pub fn start(self) -> ManagerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(cancel_rx));
        ManagerHandle {
            local_addr,
            stats,
            cancel_tx,
            task,
        }
    }

    async fn run(mut self, mut cancel_rx: watch::Receiver<bool>) {
        info!(addr = %self.local_addr, "accepting connections");

        loop {
            let draining = self.shutting_down;
            let step = {
                let listener = &self.listener;
                let events_rx = &mut self.events_rx;
                tokio::select! {
                    res = accept_next(listener) => Step::Accepted(res),
                    _ = cancel_rx.changed(), if !draining => Step::Cancel,
                    Some(event) = events_rx.recv() => Step::Event(event),
                }
            };

            match step {
                Step::Accepted(Ok((stream, peer))) => self.register_and_start(stream, peer),
                Step::Accepted(Err(e)) => {
                    // Fatal to listening only: existing connections keep
                    // running, no new ones can be accepted.
                    error!(error = %e, "acceptor error");
                    self.listener = None;
                }
                Step::Cancel => self.begin_shutdown(),
                Step::Event(ManagerEvent::ConnectionClosed { id, reason }) => {
                    self.erase_connection(id, reason);
                }
            }

            if self.shutting_down && self.registry.is_empty() {
                break;
            }
        }

        info!("connection manager stopped");
    }

    /// Registers the accepted stream before starting its task, so the
    /// registry entry exists for the connection's entire life.
    fn register_and_start(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.next_id += 1;
        let id = ConnectionId::new(self.next_id);
        let (connection, handle) = Connection::new(
            id,
            stream,
            peer,
            self.settings_template,
            Arc::clone(&self.stats),
        );
        self.registry.insert(id, Arc::downgrade(&handle));
        self.stats.connection_opened();
        info!(id = %id, client = %peer, "accepted connection");

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let reason = connection.run().await;
            // Last strong reference to the handle goes away here; the
            // registry entry is erased on the manager task.
            drop(handle);
            let _ = events.send(ManagerEvent::ConnectionClosed { id, reason });
        });
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.listener = None;
        info!("aborting accept");

        // Upgrade to a strong-reference snapshot before fanning out, so a
        // connection finishing concurrently is simply skipped.
        let live = self.registry.snapshot();
        info!(connections = live.len(), "cancelling active connections");
        for handle in live {
            handle.notify_cancel();
        }
    }

    fn erase_connection(&mut self, id: ConnectionId, reason: CloseReason) {
        if self.registry.remove(id) {
            self.stats.record_close(reason);
            debug!(
                id = %id,
                reason = %reason,
                remaining = self.registry.len(),
                "connection deregistered"
            );
        }
    }
}

async fn accept_next(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
