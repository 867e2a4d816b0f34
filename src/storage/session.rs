//! Session-scoped storage.
//!
//! A [`Session`] is a shared bag of namespaced maps whose lifetime is chosen
//! by the caller (one per connection, per user session, per process). Each
//! [`SessionStorage`] is a view onto one namespace of that bag.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{Expiring, PurgeSchedule, Storage, DEFAULT_PURGE_INTERVAL};
use crate::ratelimit::{Clock, CounterEntry, SystemClock};

type Namespaces = HashMap<String, HashMap<String, Expiring>>;

/// Shared session state. Cloning yields another handle to the same session.
#[derive(Clone, Default)]
pub struct Session {
    namespaces: Arc<Mutex<Namespaces>>,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of namespaces currently present in the session.
    pub fn namespace_count(&self) -> usize {
        self.namespaces.lock().len()
    }
}

/// Counter storage living inside one namespace of a [`Session`].
///
/// Like [`super::MemoryStorage`], expired entries go away when read and in a
/// sweep of the namespace on every [`DEFAULT_PURGE_INTERVAL`]-th write.
pub struct SessionStorage {
    session: Session,
    prefix: String,
    clock: Arc<dyn Clock>,
    purge: PurgeSchedule,
}

impl SessionStorage {
    /// Attach to the `prefix` namespace of `session`, creating it if needed.
    pub fn new(session: &Session, prefix: impl Into<String>) -> Self {
        Self::with_clock(session, prefix, Arc::new(SystemClock))
    }

    /// Like [`SessionStorage::new`] with an explicit clock for expiry.
    pub fn with_clock(session: &Session, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let prefix = prefix.into();
        session
            .namespaces
            .lock()
            .entry(prefix.clone())
            .or_default();

        Self {
            session: session.clone(),
            prefix,
            clock,
            purge: PurgeSchedule::new(DEFAULT_PURGE_INTERVAL),
        }
    }

    /// Sweep expired entries every `writes` writes. Zero disables the sweep.
    pub fn with_purge_interval(mut self, writes: u64) -> Self {
        self.purge = PurgeSchedule::new(writes);
        self
    }

    /// Drop every expired entry in this namespace. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut namespaces = self.session.namespaces.lock();
        match namespaces.get_mut(&self.prefix) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|_, item| item.is_live(now));
                before - entries.len()
            }
            None => 0,
        }
    }

    /// Number of entries in this namespace, including expired ones not yet
    /// purged.
    pub fn len(&self) -> usize {
        self.session
            .namespaces
            .lock()
            .get(&self.prefix)
            .map_or(0, HashMap::len)
    }

    /// Whether this namespace holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The namespace this storage writes into.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Storage for SessionStorage {
    fn read(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        let mut namespaces = self.session.namespaces.lock();
        let entries = namespaces.get_mut(&self.prefix)?;
        let item = *entries.get(key)?;
        if item.is_live(now) {
            Some(item.entry)
        } else {
            entries.remove(key);
            None
        }
    }

    fn write(&self, key: &str, entry: CounterEntry, ttl_secs: u64) {
        let item = Expiring::new(entry, self.clock.now(), ttl_secs);
        self.session
            .namespaces
            .lock()
            .entry(self.prefix.clone())
            .or_default()
            .insert(key.to_string(), item);
        if self.purge.record_write() {
            let purged = self.purge_expired();
            trace!(prefix = %self.prefix, purged, "Purged expired session counters");
        }
    }

    fn delete(&self, key: &str) {
        if let Some(entries) = self.session.namespaces.lock().get_mut(&self.prefix) {
            entries.remove(key);
        }
    }

    fn flush(&self) {
        self.session.namespaces.lock().remove(&self.prefix);
    }
}
