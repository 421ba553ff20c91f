//! Process-wide request rate limiting.
//!
//! A single token bucket shared by all requests. Per-peer buckets would be
//! pointless here: the only client on this network is the local guest, so the
//! burst sizing assumes exactly one caller.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Sustained request rate, per second.
pub const RATE_LIMIT_PER_SECOND: u32 = 100;

/// Bucket capacity.
pub const RATE_LIMIT_BURST: u32 = 100;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket; starts full, refills continuously at the sustained rate.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with the given sustained rate and burst capacity.
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate: f64::from(rate),
            burst: f64::from(burst),
            state: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_PER_SECOND, RATE_LIMIT_BURST)
    }
}
