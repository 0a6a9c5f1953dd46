//! # lineserv - A Connection-Oriented Line Server Core
//!
//! lineserv accepts inbound TCP connections, reads newline-delimited text
//! from each, enforces a per-connection inactivity timeout, and supports
//! coordinated shutdown of every active connection on an external signal.
//! Line payloads are logged and discarded; there is no protocol beyond the
//! terminator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         lineserv                             │
//! │                                                              │
//! │  ┌──────────────┐  accept   ┌─────────────────────────────┐  │
//! │  │ Connection   │──────────>│ Connection task (per client)│  │
//! │  │ Manager task │  register │                             │  │
//! │  │              │<──────────│  read ─> split line ─> log  │  │
//! │  │  ┌────────┐  │  teardown │  re-arm idle timer          │  │
//! │  │  │Registry│  │  notified │                             │  │
//! │  │  │ (Weak) │  │           │  exits: timeout | read      │  │
//! │  │  └────────┘  │           │  failure | cancellation     │  │
//! │  └──────┬───────┘           └─────────────────────────────┘  │
//! │         │ cancel()                                           │
//! │         ▼                                                    │
//! │  shutdown trigger (Ctrl+C): stop accepts, fan out            │
//! │  notify_cancel over a strong-reference snapshot              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Every stateful object runs on exactly one task: the manager task owns
//! the listener and the registry, and each connection task owns its socket,
//! buffer and timer. Cross-task calls (`notify_cancel`, the teardown
//! notification) are channel sends, never direct calls, so no state is ever
//! mutated from two places.
//!
//! ## Quick Start
//!
//! ```ignore
//! use lineserv::manager::{ConnectionManager, ManagerConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let manager = ConnectionManager::bind(ManagerConfig {
//!         inactivity_timeout: Duration::from_secs(3),
//!         ..Default::default()
//!     })?;
//!     let handle = manager.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`connection`]: per-connection settings, state machine and statistics
//! - [`manager`]: listener, accept loop, registry and shutdown fan-out

pub mod connection;
pub mod manager;

// Re-export commonly used types for convenience
pub use connection::{
    CloseReason, Connection, ConnectionError, ConnectionHandle, ConnectionId, ConnectionSettings,
    ConnectionStats, LifecycleState,
};
pub use manager::{ConnectionManager, ManagerConfig, ManagerHandle};

/// The default port lineserv listens on
pub const DEFAULT_PORT: u16 = 4000;

/// The default host lineserv binds to (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of lineserv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
