//! Token bucket rate limiter.
//!
//! Tokens refill continuously at `rate` bytes per second up to `capacity`;
//! consumption never waits. The rate is replaced atomically with respect to
//! future consumes; refill accrued before a rate change uses the old rate.

use std::sync::Mutex;
use std::time::Instant;

struct BucketState {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

/// Byte-rate limiter with a dynamically adjustable rate.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate,
                capacity,
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Try to take `tokens` from the bucket; returns whether they were
    /// available. Never blocks.
    pub fn consume(&self, tokens: f64) -> bool {
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(state.capacity);
        state.last_update = now;

        if state.tokens >= tokens {
            state.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Current refill rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.state.lock().expect("token bucket poisoned").rate
    }

    /// Replace the refill rate. Takes effect from the next consume.
    pub fn set_rate(&self, rate: f64) {
        self.state.lock().expect("token bucket poisoned").rate = rate;
    }

    /// Bucket capacity in bytes.
    pub fn capacity(&self) -> f64 {
        self.state.lock().expect("token bucket poisoned").capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_full_and_denies_past_capacity() {
        let bucket = TokenBucket::new(100.0, 200.0);
        assert!(bucket.consume(200.0));
        assert!(!bucket.consume(1.0));
    }

    #[tokio::test]
    async fn refills_at_rate() {
        let bucket = TokenBucket::new(100.0, 200.0);
        assert!(bucket.consume(200.0));
        assert!(!bucket.consume(1.0));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        // ~110 tokens accrued at 100/s.
        assert!(bucket.consume(100.0));
        assert!(!bucket.consume(100.0));
    }

    #[tokio::test]
    async fn refill_caps_at_capacity() {
        let bucket = TokenBucket::new(1_000_000.0, 50.0);
        assert!(bucket.consume(50.0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Far more than capacity would have accrued; only capacity is usable.
        assert!(bucket.consume(50.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn set_rate_applies_to_future_consumes() {
        let bucket = TokenBucket::new(100.0, 200.0);
        bucket.set_rate(90.0);
        assert!((bucket.rate() - 90.0).abs() < f64::EPSILON);
        assert!(bucket.consume(200.0));
    }

    #[tokio::test]
    async fn consumption_bounded_by_capacity_plus_rate() {
        let bucket = TokenBucket::new(1000.0, 500.0);
        let window = Duration::from_millis(500);
        let start = Instant::now();
        let mut consumed = 0.0;
        while start.elapsed() < window {
            if bucket.consume(50.0) {
                consumed += 50.0;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let elapsed = start.elapsed().as_secs_f64();
        assert!(
            consumed <= 500.0 + 1000.0 * elapsed + 50.0,
            "consumed {consumed} over {elapsed}s"
        );
    }
}
