//! Manager Module
//!
//! The connection manager accepts inbound connections, tracks them in a
//! weak-reference registry, and coordinates shutdown:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ConnectionManager task                    │
//! │                                                             │
//! │   accept ──> register (Weak) ──> spawn connection task      │
//! │      ▲                                     │                │
//! │      └──── re-issued immediately           │ runs to        │
//! │                                            ▼ completion     │
//! │   ConnectionClosed event <─── teardown notification         │
//! │          │                                                  │
//! │          └──> erase registry entry (only erasure path)      │
//! │                                                             │
//! │   cancel() ──> stop accepts, snapshot registry,             │
//! │                notify_cancel every live connection          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Registry entries never keep a connection alive: the spawned task holds
//! the only strong reference, so a connection's lifetime is governed by its
//! outstanding work, not by bookkeeping.

pub mod handler;
pub mod registry;

// Re-export commonly used types
pub use handler::{ConnectionManager, ManagerConfig, ManagerHandle};
