//! Token-bucket rate limiting for control-plane messages.

use std::time::Instant;

/// A token bucket refilled on demand. Each event costs one token; an empty
/// bucket denies the event and the caller drops or defers it.
#[derive(Debug, Clone)]
pub struct RateLimit {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl RateLimit {
    /// `rate` tokens per second, holding at most `burst`.
    pub fn new(rate: f64, burst: f64) -> Self {
        RateLimit {
            tokens: burst,
            rate,
            burst,
            last_refill: Instant::now(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
