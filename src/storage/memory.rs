//! In-process storage backed by a concurrent map.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::{Expiring, PurgeSchedule, Storage, DEFAULT_PURGE_INTERVAL};
use crate::ratelimit::{Clock, CounterEntry, SystemClock};

/// Process-wide counter storage.
///
/// Expired entries are dropped lazily when read, swept on every
/// [`DEFAULT_PURGE_INTERVAL`]-th write, or in bulk through
/// [`MemoryStorage::purge_expired`].
pub struct MemoryStorage {
    entries: DashMap<String, Expiring>,
    clock: Arc<dyn Clock>,
    purge: PurgeSchedule,
}

impl MemoryStorage {
    /// Create an empty storage using wall-clock time for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty storage that expires entries against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            purge: PurgeSchedule::new(DEFAULT_PURGE_INTERVAL),
        }
    }

    /// Sweep expired entries every `writes` writes. Zero disables the sweep.
    pub fn with_purge_interval(mut self, writes: u64) -> Self {
        self.purge = PurgeSchedule::new(writes);
        self
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the storage holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, item| item.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        trace!(purged, "Purged expired counters");
        purged
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        let item = *self.entries.get(key)?;
        if item.is_live(now) {
            Some(item.entry)
        } else {
            self.entries.remove_if(key, |_, current| !current.is_live(now));
            None
        }
    }

    fn write(&self, key: &str, entry: CounterEntry, ttl_secs: u64) {
        let item = Expiring::new(entry, self.clock.now(), ttl_secs);
        self.entries.insert(key.to_string(), item);
        if self.purge.record_write() {
            self.purge_expired();
        }
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn flush(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn storage_at(now: i64) -> (Arc<ManualClock>, MemoryStorage) {
        let clock = Arc::new(ManualClock::new(now));
        let storage = MemoryStorage::with_clock(clock.clone());
        (clock, storage)
    }

    #[test]
    fn test_read_absent_key() {
        let (_, storage) = storage_at(0);
        assert_eq!(storage.read("nobody"), None);
    }

    #[test]
    fn test_write_then_read() {
        let (_, storage) = storage_at(1_000);
        let entry = CounterEntry::new(9, 1_000);

        storage.write("client", entry, 60);

        assert_eq!(storage.read("client"), Some(entry));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_write_replaces_entry() {
        let (_, storage) = storage_at(1_000);

        storage.write("client", CounterEntry::new(9, 1_000), 60);
        storage.write("client", CounterEntry::new(8, 1_000), 60);

        assert_eq!(storage.read("client"), Some(CounterEntry::new(8, 1_000)));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (clock, storage) = storage_at(1_000);
        storage.write("client", CounterEntry::new(9, 1_000), 60);

        clock.advance(59);
        assert!(storage.read("client").is_some());

        clock.advance(1);
        assert_eq!(storage.read("client"), None);
        // Lazy expiry removed it
        assert!(storage.is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_, storage) = storage_at(0);
        storage.write("client", CounterEntry::new(1, 0), 60);

        storage.delete("client");
        storage.delete("client");
        storage.delete("never-written");

        assert_eq!(storage.read("client"), None);
    }

    #[test]
    fn test_flush_removes_everything() {
        let (_, storage) = storage_at(0);
        storage.write("a", CounterEntry::new(1, 0), 60);
        storage.write("b", CounterEntry::new(1, 0), 60);

        storage.flush();

        assert!(storage.is_empty());
        assert_eq!(storage.read("a"), None);
    }

    #[test]
    fn test_writes_sweep_unread_expired_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let storage = MemoryStorage::with_clock(clock.clone()).with_purge_interval(4);
        storage.write("10.0.0.1", CounterEntry::new(1, 0), 10);
        storage.write("10.0.0.2", CounterEntry::new(1, 0), 10);

        clock.advance(10);
        storage.write("10.0.0.3", CounterEntry::new(1, 10), 10);
        assert_eq!(storage.len(), 3);

        // Fourth write triggers the sweep
        storage.write("10.0.0.4", CounterEntry::new(1, 10), 10);
        assert_eq!(storage.len(), 2);
        assert!(storage.read("10.0.0.3").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let (clock, storage) = storage_at(0);
        storage.write("short", CounterEntry::new(1, 0), 10);
        storage.write("long", CounterEntry::new(1, 0), 100);

        clock.advance(50);

        assert_eq!(storage.purge_expired(), 1);
        assert_eq!(storage.len(), 1);
        assert!(storage.read("long").is_some());
    }
}
