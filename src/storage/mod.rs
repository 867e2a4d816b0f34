//! Counter storage backends.
//!
//! The limiter only ever talks to the [`Storage`] trait, so the lifetime and
//! location of counter state is decided by whoever builds the limiter: a
//! process-wide map, a per-session map, or an external cache.

mod memory;
mod session;

#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStorage;
pub use session::{Session, SessionStorage};

#[cfg(feature = "redis")]
pub use redis_store::RedisStorage;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ratelimit::CounterEntry;

/// Keyed counter persistence with per-key expiry.
///
/// Implementations are infallible from the caller's point of view. A backend
/// that can fail must report read failures as absent and log write failures.
pub trait Storage: Send + Sync {
    /// Read the entry for `key`, or `None` if absent or expired.
    fn read(&self, key: &str) -> Option<CounterEntry>;

    /// Insert or replace the entry for `key`. It becomes unreadable after
    /// `ttl_secs` seconds.
    fn write(&self, key: &str, entry: CounterEntry, ttl_secs: u64);

    /// Remove the entry for `key`. Removing an absent key is a no-op.
    fn delete(&self, key: &str);

    /// Remove every entry owned by this storage.
    fn flush(&self);
}

/// Writes between two opportunistic sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// Decides when an in-process backend sweeps expired entries on write, so
/// keys that are never read again do not pile up.
#[derive(Debug)]
struct PurgeSchedule {
    interval: u64,
    writes: AtomicU64,
}

impl PurgeSchedule {
    fn new(interval: u64) -> Self {
        Self {
            interval,
            writes: AtomicU64::new(0),
        }
    }

    /// Record one write. True on every `interval`-th write; never when the
    /// interval is zero.
    fn record_write(&self) -> bool {
        if self.interval == 0 {
            return false;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        writes % self.interval == 0
    }
}

/// An entry together with the unix second after which it is gone.
#[derive(Debug, Clone, Copy)]
struct Expiring {
    entry: CounterEntry,
    expires_at: i64,
}

impl Expiring {
    fn new(entry: CounterEntry, now: i64, ttl_secs: u64) -> Self {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        Self {
            entry,
            expires_at: now.saturating_add(ttl),
        }
    }

    fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}
