//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{CounterEntry, TimeWindow};
use crate::error::{QuotaError, Result};
use crate::storage::Storage;

/// Default number of requests per window.
pub const DEFAULT_LIMIT: u64 = 100;
/// Default window length.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(3600);

/// The quota applied by one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    limit: u64,
    period_secs: u64,
}

impl Policy {
    /// Create a policy allowing `limit` requests every `period`.
    ///
    /// The period must be a whole number of seconds, at least one. A zero
    /// limit is rejected too.
    pub fn new(limit: u64, period: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(QuotaError::InvalidPolicy(
                "limit must be greater than 0".to_string(),
            ));
        }
        let period_secs = period.as_secs();
        if period_secs == 0 || period.subsec_nanos() != 0 {
            return Err(QuotaError::InvalidPolicy(format!(
                "period must be a whole number of seconds, at least one, got {:?}",
                period
            )));
        }
        if i64::try_from(limit).is_err() || i64::try_from(period_secs).is_err() {
            return Err(QuotaError::InvalidPolicy(
                "limit and period must fit in a signed 64-bit integer".to_string(),
            ));
        }
        Ok(Self { limit, period_secs })
    }

    /// Create a policy allowing `limit` requests per named window.
    pub fn per(limit: u64, window: TimeWindow) -> Result<Self> {
        Self::new(limit, window.duration())
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    fn limit_i64(&self) -> i64 {
        self.limit as i64
    }

    fn period_i64(&self) -> i64 {
        self.period_secs as i64
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            period_secs: DEFAULT_PERIOD.as_secs(),
        }
    }
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The policy limit
    pub limit: u64,
    /// Requests left in the window, never negative
    pub remaining: u64,
    /// Seconds until the window resets
    pub reset_seconds: i64,
    /// Set when no quota key was available
    pub missing_key: bool,
}

impl Decision {
    fn counted(allowed: bool, limit: u64, remaining: i64, reset_seconds: i64) -> Self {
        Self {
            allowed,
            limit,
            remaining: remaining.max(0) as u64,
            reset_seconds,
            missing_key: false,
        }
    }

    fn missing_key(limit: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_seconds: 0,
            missing_key: true,
        }
    }
}

/// The fixed-window rate limiter.
///
/// The limiter holds no counter state of its own; everything lives in the
/// storage it was built with. The read-modify-write on a counter is not
/// atomic, so concurrent requests on one key may let a few extra requests
/// through.
pub struct RateLimiter {
    policy: Policy,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using wall-clock time.
    pub fn new(policy: Policy, storage: Arc<dyn Storage>) -> Self {
        Self::with_clock(policy, storage, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(policy: Policy, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            storage,
            clock,
        }
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The storage this limiter counts in.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Count one request against `key` and decide whether it may proceed.
    ///
    /// A missing or empty key is denied without touching storage.
    pub fn evaluate(&self, key: Option<&str>) -> Decision {
        let key = match key {
            Some(key) if !key.is_empty() => key,
            _ => {
                debug!("No rate limit key available, denying request");
                return Decision::missing_key(self.policy.limit);
            }
        };

        let now = self.clock.now();
        trace!(key = %key, now, "Evaluating rate limit");

        let entry = match self.storage.read(key) {
            Some(entry) => entry,
            None => return self.open_window(key, now),
        };

        let period = self.policy.period_i64();
        let reset = entry.seconds_until_reset(period, now);

        if entry.remaining > self.policy.limit_i64() || reset > period {
            warn!(
                key = %key,
                remaining = entry.remaining,
                created_at = entry.created_at,
                "Discarding corrupt counter entry"
            );
            self.storage.delete(key);
            return self.open_window(key, now);
        }

        let decremented = entry.remaining.saturating_sub(1);
        let remaining = if decremented >= 0 { decremented } else { -1 };

        if reset <= 0 {
            debug!(key = %key, reset, "Window elapsed, starting a new one");
            self.storage.delete(key);
            return self.open_window(key, now);
        }

        self.storage.write(
            key,
            CounterEntry::new(remaining.max(0), entry.created_at),
            reset as u64,
        );

        let allowed = remaining >= 0;
        if !allowed {
            debug!(
                key = %key,
                limit = self.policy.limit,
                reset,
                "Rate limit exceeded"
            );
        }

        Decision::counted(allowed, self.policy.limit, remaining, reset)
    }

    /// Start a fresh window for `key`, charging the current request.
    fn open_window(&self, key: &str, now: i64) -> Decision {
        let remaining = self.policy.limit_i64() - 1;
        let period = self.policy.period_i64();

        debug!(
            key = %key,
            limit = self.policy.limit,
            period,
            "Creating new rate limit window"
        );

        self.storage.write(
            key,
            CounterEntry::new(remaining, now),
            self.policy.period_secs,
        );

        Decision::counted(true, self.policy.limit, remaining, period)
    }
}
