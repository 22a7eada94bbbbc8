//! Token bucket limiter that spaces out venue requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use super::ExchangeError;

/// Limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub requests_per_second: f64,
    /// Extra requests allowed in a burst
    pub burst_size: u32,
    /// Maximum requests in flight at once
    pub max_in_flight: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20.0, // 1200 weight/min with weight-1 calls
            burst_size: 10,
            max_in_flight: 8,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let max_tokens = 1.0 + config.burst_size as f64;
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate: config.requests_per_second.max(f64::MIN_POSITIVE),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

/// Shared limiter; cloning shares the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    in_flight: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(&config))),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        }
    }

    /// Wait for a request slot. The returned permit bounds concurrency and
    /// must be held for the duration of the request.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, ExchangeError> {
        let permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| ExchangeError::Transient("rate limiter closed".to_string()))?;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_acquire() {
                    Ok(()) => break,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }

        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_allows_burst_then_waits() {
        let config = RateLimitConfig {
            requests_per_second: 10.0,
            burst_size: 2,
            max_in_flight: 1,
        };
        let mut bucket = TokenBucket::new(&config);

        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());

        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_spaces_requests() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 50.0,
            burst_size: 0,
            max_in_flight: 4,
        });

        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }
        // First token is free, the next two wait ~20ms each.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
