//! Circuit breaker for the deterministic tool gateway.
//!
//! Consecutive failures open the circuit; while open, calls fast-fail
//! without reaching the worker. After `reset_window` elapses the next call
//! is allowed through as a recovery probe; its success closes the circuit,
//! another failure re-opens it.
//!
//! One breaker instance is shared (`Arc`) across every client that fronts
//! the same worker pool, so recovery is process-wide.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default consecutive-failure threshold.
const DEFAULT_THRESHOLD: u32 = 5;

/// Default open-state duration.
const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    threshold: u32,
    reset_window: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_THRESHOLD, DEFAULT_RESET_WINDOW)
    }

    pub fn with_config(threshold: u32, reset_window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_window,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// Reject the call if the circuit is open.
    ///
    /// Once the reset window has elapsed the open marker is cleared and the
    /// call proceeds as a recovery probe.
    pub fn check(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(open_until) = state.open_until {
            let now = Instant::now();
            if now < open_until {
                let remaining = open_until.saturating_duration_since(now);
                return Err(Error::CircuitOpen(format!(
                    "retry in {:.1}s",
                    remaining.as_secs_f64()
                )));
            }
            info!("circuit reset window elapsed, allowing recovery probe");
            state.open_until = None;
        }
        Ok(())
    }

    /// Record a successful call: failures reset, circuit closes.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Record a failed call. Returns true if the circuit is now open.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.reset_window);
            warn!(
                failures = state.consecutive_failures,
                "circuit opened after {} consecutive failures", self.threshold
            );
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        self.check().is_err()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().unwrap().consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
