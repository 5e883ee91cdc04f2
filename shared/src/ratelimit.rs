//! Token-bucket rate limiter.
//!
//! Buckets are keyed by an arbitrary identifier (client IP, subdomain,
//! ...) and refill lazily on access rather than via a background
//! ticker. Idle buckets can be swept out with [`RateLimiter::sweep_idle`].

use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// A token bucket rate limiter shared across many keyed buckets.
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_second,
            buckets: DashMap::new(),
        }
    }

    /// Try to consume `cost` tokens from `id`'s bucket. Lazily refills
    /// based on elapsed time since the bucket was last touched.
    pub fn try_consume(&self, id: &str, cost: f64) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(id.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_access: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_access = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Remove buckets that have not been touched for longer than `idle_after`.
    pub fn sweep_idle(&self, idle_after: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_access) < idle_after);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Default idle eviction window.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_denies() {
        let limiter = RateLimiter::new(5, 0.0);
        for _ in 0..5 {
            assert!(limiter.try_consume("a", 1.0));
        }
        assert!(!limiter.try_consume("a", 1.0));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new(1, 0.0);
        assert!(limiter.try_consume("a", 1.0));
        assert!(limiter.try_consume("b", 1.0));
        assert!(!limiter.try_consume("a", 1.0));
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(1, 1000.0); // fast refill for the test
        assert!(limiter.try_consume("a", 1.0));
        assert!(!limiter.try_consume("a", 1.0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_consume("a", 1.0));
    }

    #[test]
    fn sweep_idle_evicts_untouched_buckets() {
        let limiter = RateLimiter::new(5, 1.0);
        limiter.try_consume("a", 1.0);
        limiter.sweep_idle(Duration::from_millis(0));
        assert_eq!(limiter.bucket_count(), 0);
    }
}
