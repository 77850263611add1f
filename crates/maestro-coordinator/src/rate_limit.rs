use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter keyed by an arbitrary string (policy + agent).
///
/// Bucket parameters are supplied per call so that a reloaded policy takes
/// effect without resetting existing buckets.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` has a whole token, without consuming it.
    /// - `burst`: maximum bucket size
    /// - `refill_rate`: tokens added per second
    pub fn available(&self, key: &str, burst: f64, refill_rate: f64) -> bool {
        let buckets = self.buckets.lock();
        let tokens = match buckets.get(key) {
            Some(bucket) => refilled(bucket, Instant::now(), burst, refill_rate),
            None => burst,
        };
        tokens >= 1.0
    }

    /// Consume one token for `key`, refilling first. Never goes below zero.
    pub fn take(&self, key: &str, burst: f64, refill_rate: f64) {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
        });
        bucket.tokens = (refilled(bucket, now, burst, refill_rate) - 1.0).max(0.0);
        bucket.last_refill = now;
    }

    /// Remove buckets with no activity for `max_idle`.
    pub fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

fn refilled(bucket: &Bucket, now: Instant, burst: f64, refill_rate: f64) -> f64 {
    let elapsed = now.duration_since(bucket.last_refill);
    (bucket.tokens + elapsed.as_secs_f64() * refill_rate).min(burst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.available("p:a1", 5.0, 1.0));
            limiter.take("p:a1", 5.0, 1.0);
        }
    }

    #[test]
    fn test_rate_limiter_blocks() {
        let limiter = RateLimiter::new();
        limiter.take("p:a1", 2.0, 0.1);
        assert!(limiter.available("p:a1", 2.0, 0.1));
        limiter.take("p:a1", 2.0, 0.1);
        assert!(!limiter.available("p:a1", 2.0, 0.1));
        // Separate key has its own bucket.
        assert!(limiter.available("p:a2", 2.0, 0.1));
    }

    #[test]
    fn test_available_does_not_consume() {
        let limiter = RateLimiter::new();
        limiter.take("p:a1", 1.0, 0.0001);
        for _ in 0..3 {
            assert!(!limiter.available("p:a1", 1.0, 0.0001));
        }
        assert!(limiter.available("p:a2", 1.0, 0.0001));
        assert!(limiter.available("p:a2", 1.0, 0.0001));
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_cleanup_removes_idle() {
        let limiter = RateLimiter::new();
        limiter.take("p:a1", 1.0, 1.0);
        assert_eq!(limiter.bucket_count(), 1);
        limiter.cleanup(Duration::ZERO);
        assert_eq!(limiter.bucket_count(), 0);
    }
}
