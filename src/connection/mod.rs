//! Connection Module
//!
//! This module owns everything about a single accepted connection: its
//! settings, its read buffer, its idle timer and its lifecycle state
//! machine. Each connection runs on its own async task, so all of its
//! mutable state is touched from exactly one place.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                        │
//! │                     (manager module)                        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept()
//!                        │ spawn task (holds the only Arc)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Connection                             │
//! │                                                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐   │
//! │  │ Read bytes  │──>│ Split a line │──>│ Log + re-arm    │   │
//! │  └─────────────┘   └──────────────┘   │ idle timer      │   │
//! │        ▲                              └────────┬────────┘   │
//! │        └───────────────────────────────────────┘            │
//! │                                                             │
//! │  exits: idle timeout │ read failure │ notify_cancel()       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager observes connections only through [`ConnectionHandle`]s held
//! behind `Weak` references; a connection's lifetime is governed by its own
//! task, not by the registry.

pub mod handler;
pub mod settings;

// Re-export commonly used types
pub use handler::{
    CloseReason, Connection, ConnectionError, ConnectionHandle, ConnectionId, ConnectionStats,
    LifecycleState, MAX_LINE_BYTES,
};
pub use settings::ConnectionSettings;
