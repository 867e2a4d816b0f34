//! Rate limiting logic and state management.

mod clock;
mod counter;
mod limiter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, TimeWindow};
pub use limiter::{Decision, Policy, RateLimiter, DEFAULT_LIMIT, DEFAULT_PERIOD};
