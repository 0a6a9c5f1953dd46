//! Connection Registry
//!
//! The manager's bookkeeping of live connections. Entries are weak
//! references: the registry can look a connection up while it is alive, but
//! never keeps one alive. Only the manager task mutates the registry, so
//! insertion, erasure and the cancellation snapshot can never race.

use crate::connection::{ConnectionHandle, ConnectionId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Mapping from connection identity to a non-owning handle reference.
///
/// Entries are inserted when a connection is accepted (before its task
/// starts) and erased only when the connection's task reports its own
/// teardown. A weak reference that no longer upgrades belongs to a
/// connection whose teardown notification is still in flight; `snapshot`
/// simply skips it.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<ConnectionId, Weak<ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, id: ConnectionId, handle: Weak<ConnectionHandle>) {
        self.entries.insert(id, handle);
    }

    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Resolves every entry that is still alive into a strong reference.
    ///
    /// Cancellation fans out over this snapshot rather than over the map
    /// itself, so a connection erasing its entry concurrently with shutdown
    /// is never called into mid-removal.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.entries
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
