//! Token-bucket rate limiting per (client, service)

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;

use crate::config::FetcherConfig;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-(client, service) token buckets. `consume` is serialized per bucket
/// by its own lock, so concurrent callers can never double-spend a token.
pub struct RateLimiter {
    buckets: DashMap<(String, String), Mutex<TokenBucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(config: &FetcherConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: config.bucket_capacity,
            refill_per_sec: config.bucket_refill_per_sec,
        }
    }

    /// Try to take one token; false means the caller must skip the call.
    pub fn consume(&self, client_id: &str, service: &str) -> bool {
        let key = (client_id.to_string(), service.to_string());
        let capacity = self.capacity;
        let entry = self.buckets.entry(key).or_insert_with(|| {
            Mutex::new(TokenBucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })
        });
        let mut bucket = entry.lock();

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Remaining tokens, for the status surface.
    pub fn remaining(&self, client_id: &str, service: &str) -> f64 {
        self.buckets
            .get(&(client_id.to_string(), service.to_string()))
            .map(|b| b.lock().tokens)
            .unwrap_or(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, refill: f64) -> RateLimiter {
        RateLimiter::new(&FetcherConfig {
            bucket_capacity: capacity,
            bucket_refill_per_sec: refill,
            ..Default::default()
        })
    }

    #[test]
    fn consume_drains_then_denies() {
        let limiter = limiter(2.0, 0.0);
        assert!(limiter.consume("c1", "brave"));
        assert!(limiter.consume("c1", "brave"));
        assert!(!limiter.consume("c1", "brave"));
    }

    #[test]
    fn buckets_are_isolated_per_client_and_service() {
        let limiter = limiter(1.0, 0.0);
        assert!(limiter.consume("c1", "brave"));
        assert!(!limiter.consume("c1", "brave"));
        // other client, other service still have full buckets
        assert!(limiter.consume("c2", "brave"));
        assert!(limiter.consume("c1", "market"));
    }

    #[test]
    fn refill_restores_tokens() {
        let limiter = limiter(1.0, 1_000_000.0);
        assert!(limiter.consume("c1", "brave"));
        // enormous refill rate means the next call sees a full bucket again
        assert!(limiter.consume("c1", "brave"));
    }
}
