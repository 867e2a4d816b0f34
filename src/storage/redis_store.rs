//! Redis-backed storage for limiters shared between processes.
//!
//! Every failure here fails open: a read error looks like an absent key and
//! write errors are logged and dropped, so an unreachable cache never blocks
//! traffic.

use std::time::Duration;

use parking_lot::Mutex;
use redis::Commands;
use tracing::{debug, warn};

use super::Storage;
use crate::error::{QuotaError, Result};
use crate::ratelimit::CounterEntry;

/// Counter storage in Redis. Entries are JSON values stored with `SET EX`.
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisStorage {
    /// Create a storage writing keys under `prefix`.
    ///
    /// No connection is opened until the first operation.
    pub fn new(client: redis::Client, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Open a client for `url` and wrap it.
    pub fn open(url: &str, prefix: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client, prefix, timeout))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Run `op` on a live connection, reconnecting if needed. The connection
    /// is dropped after any error so the next call starts fresh.
    fn with_conn<T>(&self, op: impl FnOnce(&mut redis::Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let conn = self.client.get_connection_with_timeout(self.timeout)?;
            conn.set_read_timeout(Some(self.timeout))?;
            conn.set_write_timeout(Some(self.timeout))?;
            debug!(prefix = %self.prefix, "Connected to redis");
            *guard = Some(conn);
        }

        let conn = guard
            .as_mut()
            .ok_or_else(|| QuotaError::Storage("redis connection unavailable".to_string()))?;
        let result = op(conn);
        if result.is_err() {
            *guard = None;
        }
        result
    }

    fn try_read(&self, key: &str) -> Result<Option<CounterEntry>> {
        let full_key = self.full_key(key);
        let raw: Option<String> = self.with_conn(|conn| Ok(conn.get(&full_key)?))?;
        match raw {
            Some(raw) => decode_entry(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn try_write(&self, key: &str, entry: CounterEntry, ttl_secs: u64) -> Result<()> {
        let full_key = self.full_key(key);
        let value = encode_entry(&entry)?;
        // SET EX rejects a zero TTL
        let ttl = ttl_secs.max(1);
        self.with_conn(|conn| Ok(conn.set_ex::<_, _, ()>(&full_key, value, ttl)?))
    }

    fn try_delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        self.with_conn(|conn| Ok(conn.del::<_, ()>(&full_key)?))
    }

    fn try_flush(&self) -> Result<usize> {
        let pattern = format!("{}*", self.prefix);
        self.with_conn(|conn| {
            let keys: Vec<String> = conn.scan_match::<_, String>(&pattern)?.collect();
            if !keys.is_empty() {
                conn.del::<_, ()>(&keys)?;
            }
            Ok(keys.len())
        })
    }
}

impl Storage for RedisStorage {
    fn read(&self, key: &str) -> Option<CounterEntry> {
        match self.try_read(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Counter read failed, treating as absent");
                None
            }
        }
    }

    fn write(&self, key: &str, entry: CounterEntry, ttl_secs: u64) {
        if let Err(e) = self.try_write(key, entry, ttl_secs) {
            warn!(key = %key, error = %e, "Counter write failed");
        }
    }

    fn delete(&self, key: &str) {
        if let Err(e) = self.try_delete(key) {
            warn!(key = %key, error = %e, "Counter delete failed");
        }
    }

    fn flush(&self) {
        match self.try_flush() {
            Ok(count) => debug!(prefix = %self.prefix, count, "Flushed counters"),
            Err(e) => warn!(prefix = %self.prefix, error = %e, "Counter flush failed"),
        }
    }
}

fn encode_entry(entry: &CounterEntry) -> Result<String> {
    serde_json::to_string(entry).map_err(|e| QuotaError::Storage(e.to_string()))
}

fn decode_entry(raw: &str) -> Result<CounterEntry> {
    serde_json::from_str(raw)
        .map_err(|e| QuotaError::Storage(format!("corrupt counter entry: {}", e)))
}
