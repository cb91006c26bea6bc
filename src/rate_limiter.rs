use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether to enable rate limiting
    pub enabled: bool,
    /// Steady-state refill rate in tokens per second
    pub requests_per_second: f64,
    /// Bucket capacity (largest admitted burst)
    pub burst_size: u32,
    /// How long a submitter may wait for a token before being rejected (0 = never wait)
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100.0,
            burst_size: 10,
            max_wait_ms: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Shared token bucket gating every submission on one session.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
}

/// Absorbs float drift so a bucket refilled for exactly `cost` admits it.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64) -> Self {
        let max_tokens = f64::from(max_tokens.max(1));
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    fn try_consume(&mut self, cost: f64) -> Result<(), Duration> {
        self.refill();

        if self.tokens + TOKEN_EPSILON >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            Err(self.time_until(cost))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    fn time_until(&self, cost: f64) -> Duration {
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        let missing = (cost - self.tokens).max(0.0);
        Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX)
    }
}

/// Result of rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = TokenBucket::new(config.burst_size, config.requests_per_second);
        Self {
            config,
            bucket: Mutex::new(bucket),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take `cost` tokens, or report how long until they would be available.
    pub fn try_acquire(&self, cost: u32) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed;
        }

        let cost = f64::from(cost);
        let mut bucket = self.lock();
        if cost > bucket.max_tokens {
            warn!(cost, capacity = bucket.max_tokens, "Cost exceeds bucket capacity");
            return RateLimitResult::Limited {
                retry_after: Duration::MAX,
            };
        }

        match bucket.try_consume(cost) {
            Ok(()) => {
                debug!(remaining = bucket.tokens, "Rate limit check passed");
                RateLimitResult::Allowed
            }
            Err(retry_after) => {
                debug!(?retry_after, "Rate limit exceeded");
                RateLimitResult::Limited { retry_after }
            }
        }
    }

    /// Acquire `cost` tokens, sleeping while the required wait stays within `max_wait`.
    ///
    /// Never waits longer than `max_wait` in total; past that the last wait hint is returned.
    pub async fn acquire(&self, cost: u32, max_wait: Duration) -> RateLimitResult {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.try_acquire(cost) {
                RateLimitResult::Allowed => return RateLimitResult::Allowed,
                RateLimitResult::Limited { retry_after } => {
                    match Instant::now().checked_add(retry_after) {
                        Some(ready) if ready <= deadline => tokio::time::sleep(retry_after).await,
                        _ => return RateLimitResult::Limited { retry_after },
                    }
                }
            }
        }
    }

    /// Tokens currently in the bucket (after refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill();
        bucket.tokens
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}
