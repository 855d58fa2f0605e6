//! Token-bucket rate limiting with jitter support.
//!
//! Allows bursts while maintaining an average rate. Monotonic time
//! (`Instant`) avoids clock-skew issues. The refill-then-consume step is
//! guarded by a mutex so a single bucket can be shared across workers.

use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Token bucket rate limiter.
///
/// `capacity` is the maximum burst size; tokens refill at
/// `rate_per_minute / 60` per second.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate_per_sec: f64,
    jitter_max: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter from a requests-per-minute rate.
    ///
    /// Rejects non-positive rates.
    pub fn new(rate_per_minute: f64, burst: u32) -> Result<Self> {
        if rate_per_minute <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "rate must be positive, got {rate_per_minute}/min"
            )));
        }
        let capacity = burst.max(1) as f64;
        debug!(rate_per_minute, burst, "rate limiter initialized");
        Ok(Self {
            capacity,
            rate_per_sec: rate_per_minute / 60.0,
            jitter_max: Duration::ZERO,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last: Instant::now(),
            }),
        })
    }

    /// Add uniform-random jitter in `[0, jitter_max]` to each blocking wait.
    pub fn with_jitter(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    /// Refill the bucket from elapsed time and try to take one token.
    /// Returns the wait needed when no token is available.
    fn refill_and_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.last = now;
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - state.tokens;
            // The waiting caller will own the token that accrues during the
            // sleep; zeroing prevents double-spending it.
            state.tokens = 0.0;
            Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }

    /// Acquire a token, sleeping if the bucket is empty.
    ///
    /// Returns the time waited (zero when a token was immediately
    /// available).
    pub async fn acquire(&self) -> Duration {
        match self.refill_and_take() {
            None => Duration::ZERO,
            Some(mut wait) => {
                if !self.jitter_max.is_zero() {
                    let jitter = rand::thread_rng()
                        .gen_range(Duration::ZERO..=self.jitter_max);
                    debug!(?jitter, "adding jitter");
                    wait += jitter;
                }
                info!(wait_s = wait.as_secs_f64(), "rate limiting");
                tokio::time::sleep(wait).await;
                wait
            }
        }
    }

    /// Try to acquire a token without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        let potential = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);

        if potential >= 1.0 {
            state.last = now;
            state.tokens = potential - 1.0;
            true
        } else {
            false
        }
    }

    /// Estimated wait until the next token is available.
    pub fn wait_time(&self) -> Duration {
        let state = self.state.lock().expect("rate limiter lock poisoned");
        let elapsed = state.last.elapsed().as_secs_f64();
        let potential = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        if potential >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - potential) / self.rate_per_sec)
        }
    }

    /// Reset to full capacity.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        state.tokens = self.capacity;
        state.last = Instant::now();
        debug!("rate limiter reset");
    }
}

/// Parse a rate string like `"10/min"`, `"5/sec"`, or `"60/hour"` into
/// requests per minute.
pub fn parse_rate(rate_str: &str) -> Result<f64> {
    let normalized = rate_str.trim().to_lowercase();
    let (value_str, unit) = normalized.split_once('/').ok_or_else(|| {
        Error::InvalidInput(format!(
            "invalid rate string '{rate_str}': expected format like '10/min'"
        ))
    })?;

    let value: f64 = value_str.trim().parse().map_err(|_| {
        Error::InvalidInput(format!("invalid rate value in '{rate_str}'"))
    })?;
    if value <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "rate must be positive, got '{rate_str}'"
        )));
    }

    let per_minute = match unit.trim() {
        "min" | "minute" | "minutes" => value,
        "sec" | "second" | "seconds" | "s" => value * 60.0,
        "hour" | "hours" | "h" | "hr" => value / 60.0,
        other => {
            return Err(Error::InvalidInput(format!(
                "unknown time unit '{other}' in rate string '{rate_str}'"
            )))
        }
    };
    Ok(per_minute)
}

/// Rate limiter shared by every adapter targeting the same quota.
///
/// All registered sharers acquire against a single bucket.
#[derive(Debug, Clone)]
pub struct GlobalRateLimiter {
    limiter: Arc<RateLimiter>,
    adapters: Arc<Mutex<Vec<String>>>,
}

impl GlobalRateLimiter {
    pub fn new(rate_per_minute: f64, burst: u32) -> Result<Self> {
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(rate_per_minute, burst)?),
            adapters: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Register an adapter as a sharer of this bucket.
    pub fn register_adapter(&self, adapter_name: impl Into<String>) {
        let name = adapter_name.into();
        let mut adapters = self.adapters.lock().expect("adapter list lock poisoned");
        if !adapters.contains(&name) {
            info!(adapter = %name, "registered adapter with global rate limiter");
            adapters.push(name);
        }
    }

    /// Acquire a token for any sharer.
    pub async fn acquire(&self, adapter_name: Option<&str>) -> Duration {
        if let Some(name) = adapter_name {
            debug!(adapter = name, "acquiring global rate limit token");
        }
        self.limiter.acquire().await
    }

    /// Names of registered sharers, sorted.
    pub fn registered_adapters(&self) -> Vec<String> {
        let mut adapters = self
            .adapters
            .lock()
            .expect("adapter list lock poisoned")
            .clone();
        adapters.sort();
        adapters
    }

    /// Access the underlying bucket.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_rate_units() {
        assert_eq!(parse_rate("10/min").unwrap(), 10.0);
        assert_eq!(parse_rate("5/sec").unwrap(), 300.0);
        assert_eq!(parse_rate("60/hour").unwrap(), 1.0);
        assert_eq!(parse_rate(" 2 / s ").unwrap(), 120.0);
    }

    #[test]
    fn test_parse_rate_rejects_bad_input() {
        assert!(parse_rate("10").is_err());
        assert!(parse_rate("abc/min").is_err());
        assert!(parse_rate("10/fortnight").is_err());
        assert!(parse_rate("0/min").is_err());
        assert!(parse_rate("-5/sec").is_err());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(RateLimiter::new(0.0, 1).is_err());
        assert!(RateLimiter::new(-10.0, 1).is_err());
    }

    #[test]
    fn test_burst_admits_capacity_then_blocks() {
        // 60/min with burst 3: exactly 3 immediate tokens after cold start.
        let limiter = RateLimiter::new(60.0, 3).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.wait_time() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(60.0, 1).unwrap();
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        // Bucket is now empty; the next acquire must sleep ~1s at 1 req/s.
        let waited = limiter.acquire().await;
        assert!(waited > Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_reset_restores_capacity() {
        let limiter = RateLimiter::new(60.0, 2).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        limiter.reset();
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_global_limiter_shares_bucket() {
        let global = GlobalRateLimiter::new(60.0, 1).unwrap();
        global.register_adapter("openai");
        global.register_adapter("anthropic");
        global.register_adapter("openai");

        assert_eq!(global.registered_adapters(), vec!["anthropic", "openai"]);

        // One token total across both adapters.
        assert!(global.limiter().try_acquire());
        assert!(!global.limiter().try_acquire());
    }
}
