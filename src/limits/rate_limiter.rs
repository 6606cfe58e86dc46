//! Token-bucket admission control.
//!
//! A continuously-refilling reservoir admitting bursts up to `burst_size`.
//! Unlike a fail-fast limiter, `acquire` suspends the caller until tokens
//! are available, so upstream fan-out simply slows down instead of erroring.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::trace;

use crate::error::{Error, Result};

/// Async token-bucket rate limiter.
///
/// Refill and debit happen under one mutex; waiting happens outside it.
pub struct RateLimiter {
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens held (bucket starts full).
    burst_size: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter with the default burst of `2 * rate`.
    pub fn new(rate: f64) -> Self {
        Self::with_burst(rate, rate * 2.0)
    }

    /// Create a limiter with an explicit burst size.
    pub fn with_burst(rate: f64, burst_size: f64) -> Self {
        assert!(rate > 0.0, "rate must be positive");
        assert!(burst_size > 0.0, "burst_size must be positive");
        Self {
            rate,
            burst_size,
            state: Mutex::new(BucketState {
                tokens: burst_size,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire `n` tokens, sleeping until they are available.
    ///
    /// After each sleep the bucket is re-checked: a concurrent acquirer may
    /// have consumed the refill the wait estimate was based on.
    pub async fn acquire(&self, n: f64) -> Result<()> {
        if n <= 0.0 {
            return Err(Error::Validation(format!(
                "token count must be positive, got {n}"
            )));
        }
        if n > self.burst_size {
            return Err(Error::Validation(format!(
                "cannot acquire {n} tokens from a bucket of capacity {}",
                self.burst_size
            )));
        }

        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst_size);
                state.last_refill = now;

                if state.tokens >= n {
                    state.tokens -= n;
                    return Ok(());
                }
                (n - state.tokens) / self.rate
            };

            trace!(wait_s = wait, "rate limited, waiting for refill");
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Acquire a single token.
    pub async fn acquire_one(&self) -> Result<()> {
        self.acquire(1.0).await
    }

    /// Current token count after refill (for inspection).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst_size);
        state.last_refill = now;
        state.tokens
    }
}
