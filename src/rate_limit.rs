use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use rocket::Request;
use rocket::http::Header;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;

/// Token bucket per key (client_id when authenticated, source IP otherwise).
/// Capacity and refill default to `RATE_LIMIT_PER_MINUTE`; the limit applies
/// uniformly to socket frames, polling posts, and room actions.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Outcome of a rate-limit check, shaped for response headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Milliseconds until one token becomes available. 0 when allowed.
    pub retry_after_ms: u64,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: per_minute as f64,
            refill_per_sec: per_minute as f64 / 60.0,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.check_with_info(key).allowed
    }

    /// Take one token from `key`'s bucket, reporting headers either way.
    pub fn check_with_info(&self, key: &str) -> RateLimitInfo {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitInfo {
                allowed: true,
                limit: self.capacity as u32,
                remaining: bucket.tokens as u32,
                retry_after_ms: 0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = ((deficit / self.refill_per_sec) * 1000.0).ceil() as u64;
            RateLimitInfo {
                allowed: false,
                limit: self.capacity as u32,
                remaining: 0,
                retry_after_ms,
            }
        }
    }
}

/// Wrapper that adds standard rate limit headers to any JSON response.
/// Headers: X-RateLimit-Limit, X-RateLimit-Remaining, X-RateLimit-Reset
pub struct RateLimited<T> {
    pub inner: Json<T>,
    pub info: RateLimitInfo,
}

impl<T> RateLimited<T> {
    pub fn new(inner: Json<T>, info: RateLimitInfo) -> Self {
        Self { inner, info }
    }
}

impl<'r, 'o: 'r, T: serde::Serialize + 'o> Responder<'r, 'o> for RateLimited<T> {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let response = Response::build_from(self.inner.respond_to(req)?)
            .header(Header::new("X-RateLimit-Limit", self.info.limit.to_string()))
            .header(Header::new(
                "X-RateLimit-Remaining",
                self.info.remaining.to_string(),
            ))
            .header(Header::new(
                "X-RateLimit-Reset",
                self.info.retry_after_ms.div_ceil(1000).to_string(),
            ))
            .finalize();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(60);
        for i in 0..60 {
            assert!(limiter.check("k"), "request {i} should pass");
        }
        let info = limiter.check_with_info("k");
        assert!(!info.allowed);
        assert!(info.retry_after_ms > 0);
        assert_eq!(info.remaining, 0);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = RateLimiter::new(6000); // 100 tokens/sec for a fast test
        for _ in 0..6000 {
            limiter.check("k");
        }
        assert!(!limiter.check("k"));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(limiter.check("k"));
    }

    #[test]
    fn retry_after_reflects_refill_rate() {
        let limiter = RateLimiter::new(60); // 1 token/sec
        for _ in 0..60 {
            limiter.check("k");
        }
        let info = limiter.check_with_info("k");
        assert!(!info.allowed);
        // One token a second: the hint should be about a second out.
        assert!(info.retry_after_ms <= 1100, "got {}", info.retry_after_ms);
    }
}
