//! Token-bucket rate limiting for the Railway API.
//!
//! Two buckets are enforced together: a per-second burst bucket and a
//! per-hour budget bucket. `acquire` waits rather than erroring, so
//! callers see latency instead of failures when the budget is tight.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or return how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Combined per-second + per-hour rate limiter.
pub struct RateLimiter {
    buckets: Mutex<(Bucket, Bucket)>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(per_second: u32, per_hour: u32) -> Self {
        Self {
            buckets: Mutex::new((
                Bucket::new(per_second, Duration::from_secs(1)),
                Bucket::new(per_hour, Duration::from_secs(3600)),
            )),
        }
    }

    /// Wait until both buckets grant a token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let (ref mut second, ref mut hour) = *guard;

                match (second.try_take(now), hour.try_take(now)) {
                    (Ok(()), Ok(())) => None,
                    (Ok(()), Err(wait)) => {
                        // Refund the second-bucket token; only the hour
                        // bucket is exhausted.
                        second.tokens = (second.tokens + 1.0).min(second.capacity);
                        Some(wait)
                    }
                    (Err(wait), Ok(())) => {
                        hour.tokens = (hour.tokens + 1.0).min(hour.capacity);
                        Some(wait)
                    }
                    (Err(a), Err(b)) => Some(a.max(b)),
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "Rate limiter waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Tokens currently available in the per-second bucket (for tests and
    /// diagnostics).
    #[must_use]
    pub fn available_burst(&self) -> u32 {
        let mut guard = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        guard.0.refill(now);
        guard.0.tokens as u32
    }
}
