//! Resource-quota enforcement for agent fan-out.
//!
//! [`DispatchResourceLimits`] is pure configuration; every field is
//! optional and an unset field is unenforced. [`DispatchLimitTracker`]
//! holds the runtime counters, pre-checks a dispatch before any work
//! starts, gates concurrency with a semaphore, and re-checks every ceiling
//! as completions are recorded. A breach is returned as an explicit
//! `Error::Quota` the caller must treat as fatal to the whole batch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{Error, Result};

fn default_failure_rate_min_samples() -> usize {
    5
}

/// Ceilings for one fan-out dispatch. Unset fields are unenforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResourceLimits {
    /// Cumulative cost ceiling in USD.
    #[serde(default)]
    pub max_total_cost_usd: Option<f64>,

    /// Expected cost of one agent call, used by the pre-dispatch check.
    #[serde(default)]
    pub cost_per_agent_estimate: Option<f64>,

    /// Maximum agents in flight at once.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum agents launched over the whole dispatch.
    #[serde(default)]
    pub max_total_agents: Option<usize>,

    /// Per-agent wall-clock ceiling in seconds.
    #[serde(default)]
    pub max_duration_per_agent_s: Option<f64>,

    /// Whole-dispatch wall-clock ceiling in seconds.
    #[serde(default)]
    pub max_total_duration_s: Option<f64>,

    /// Admission rate passed to the rate limiter by callers.
    #[serde(default)]
    pub requests_per_second: Option<f64>,

    /// Maximum tolerated failure rate (0.0 - 1.0).
    #[serde(default)]
    pub max_failure_rate: Option<f64>,

    /// Completions required before the failure rate is enforced, damping
    /// small-sample noise.
    #[serde(default = "default_failure_rate_min_samples")]
    pub failure_rate_min_samples: usize,

    /// Minimum successes the whole dispatch must produce (0 = disabled).
    #[serde(default)]
    pub min_success_count: usize,

    /// Maximum recursion depth for nested dispatches.
    #[serde(default)]
    pub max_dispatch_depth: Option<u32>,

    /// Depth of the dispatch being checked.
    #[serde(default)]
    pub current_dispatch_depth: u32,
}

impl Default for DispatchResourceLimits {
    fn default() -> Self {
        Self {
            max_total_cost_usd: None,
            cost_per_agent_estimate: None,
            max_concurrent: None,
            max_total_agents: None,
            max_duration_per_agent_s: None,
            max_total_duration_s: None,
            requests_per_second: None,
            max_failure_rate: None,
            failure_rate_min_samples: default_failure_rate_min_samples(),
            min_success_count: 0,
            max_dispatch_depth: None,
            current_dispatch_depth: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    total_cost: f64,
    total_agents: usize,
    completed_agents: usize,
    failed_agents: usize,
    concurrent_count: usize,
}

/// Point-in-time snapshot of tracker counters.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub total_cost: f64,
    pub total_agents: usize,
    pub completed_agents: usize,
    pub failed_agents: usize,
    pub concurrent_count: usize,
    pub elapsed_s: f64,
}

/// Runtime quota tracker for one dispatch.
pub struct DispatchLimitTracker {
    limits: DispatchResourceLimits,
    state: Mutex<TrackerState>,
    /// Native bounded-concurrency gate when `max_concurrent` is set.
    semaphore: Option<Arc<Semaphore>>,
    start: Instant,
}

impl DispatchLimitTracker {
    pub fn new(limits: DispatchResourceLimits) -> Self {
        let semaphore = limits.max_concurrent.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            limits,
            state: Mutex::new(TrackerState::default()),
            semaphore,
            start: Instant::now(),
        }
    }

    pub fn limits(&self) -> &DispatchResourceLimits {
        &self.limits
    }

    /// Check the dispatch before any work starts.
    ///
    /// Rejects when `n` exceeds the agent ceiling, when the estimated total
    /// cost exceeds the cost ceiling, or when the dispatch is already
    /// nested too deep.
    pub fn check_pre_dispatch(&self, n: usize) -> Result<()> {
        if let Some(max_agents) = self.limits.max_total_agents {
            if n > max_agents {
                return Err(Error::Quota(format!(
                    "dispatch of {n} agents exceeds max_total_agents={max_agents}"
                )));
            }
        }

        if let (Some(max_cost), Some(estimate)) = (
            self.limits.max_total_cost_usd,
            self.limits.cost_per_agent_estimate,
        ) {
            let estimated = n as f64 * estimate;
            if estimated > max_cost {
                return Err(Error::Quota(format!(
                    "estimated cost ${estimated:.2} for {n} agents exceeds max_total_cost_usd=${max_cost:.2}"
                )));
            }
        }

        if let Some(max_depth) = self.limits.max_dispatch_depth {
            if self.limits.current_dispatch_depth > max_depth {
                return Err(Error::Quota(format!(
                    "dispatch depth {} exceeds max_dispatch_depth={max_depth}",
                    self.limits.current_dispatch_depth
                )));
            }
        }

        Ok(())
    }

    /// Acquire a concurrency slot, waiting if the gate is saturated.
    ///
    /// Each successful acquire counts one launched agent. Pair with
    /// [`release_slot`](Self::release_slot).
    pub async fn acquire_slot(&self) -> Result<()> {
        if let Some(semaphore) = &self.semaphore {
            let permit = semaphore
                .acquire()
                .await
                .map_err(|_| Error::Internal("concurrency gate closed".into()))?;
            permit.forget();
        }

        let mut state = self.state.lock().unwrap();
        state.total_agents += 1;
        state.concurrent_count += 1;
        Ok(())
    }

    /// Release a previously acquired concurrency slot.
    pub fn release_slot(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.concurrent_count = state.concurrent_count.saturating_sub(1);
        }
        if let Some(semaphore) = &self.semaphore {
            semaphore.add_permits(1);
        }
    }

    /// Record one finished agent and re-check every ceiling.
    ///
    /// A breach is returned immediately; the caller must propagate it as a
    /// batch-fatal signal, not a per-task failure.
    pub fn record_agent_completion(
        &self,
        cost: f64,
        success: bool,
        duration: Option<Duration>,
    ) -> Result<()> {
        let (total_cost, completed, failed) = {
            let mut state = self.state.lock().unwrap();
            state.total_cost += cost;
            state.completed_agents += 1;
            if !success {
                state.failed_agents += 1;
            }
            (state.total_cost, state.completed_agents, state.failed_agents)
        };

        if let Some(max_cost) = self.limits.max_total_cost_usd {
            if total_cost > max_cost {
                warn!(total_cost, max_cost, "cumulative cost ceiling breached");
                return Err(Error::Quota(format!(
                    "cumulative cost ${total_cost:.2} exceeds max_total_cost_usd=${max_cost:.2}"
                )));
            }
        }

        if let Some(max_rate) = self.limits.max_failure_rate {
            if completed >= self.limits.failure_rate_min_samples {
                let rate = failed as f64 / completed as f64;
                if rate > max_rate {
                    warn!(rate, max_rate, completed, "failure rate ceiling breached");
                    return Err(Error::Quota(format!(
                        "failure rate {rate:.2} over {completed} completions exceeds max_failure_rate={max_rate:.2}"
                    )));
                }
            }
        }

        if let (Some(max_duration), Some(duration)) =
            (self.limits.max_duration_per_agent_s, duration)
        {
            if duration.as_secs_f64() > max_duration {
                return Err(Error::Quota(format!(
                    "agent ran {:.1}s, exceeding max_duration_per_agent_s={max_duration:.1}",
                    duration.as_secs_f64()
                )));
            }
        }

        if let Some(max_total) = self.limits.max_total_duration_s {
            let elapsed = self.start.elapsed().as_secs_f64();
            if elapsed > max_total {
                return Err(Error::Quota(format!(
                    "dispatch has run {elapsed:.1}s, exceeding max_total_duration_s={max_total:.1}"
                )));
            }
        }

        Ok(())
    }

    /// Read-only snapshot of the current counters.
    pub fn get_stats(&self) -> DispatchStats {
        let state = self.state.lock().unwrap();
        DispatchStats {
            total_cost: state.total_cost,
            total_agents: state.total_agents,
            completed_agents: state.completed_agents,
            failed_agents: state.failed_agents,
            concurrent_count: state.concurrent_count,
            elapsed_s: self.start.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_dispatch_rejects_on_estimated_cost() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits {
            max_total_cost_usd: Some(1.0),
            cost_per_agent_estimate: Some(0.3),
            ..Default::default()
        });

        assert!(tracker.check_pre_dispatch(3).is_ok());
        let err = tracker.check_pre_dispatch(4).unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn test_pre_dispatch_rejects_on_agent_count() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits {
            max_total_agents: Some(2),
            ..Default::default()
        });

        assert!(tracker.check_pre_dispatch(2).is_ok());
        assert!(tracker.check_pre_dispatch(3).is_err());
    }

    #[test]
    fn test_pre_dispatch_rejects_on_depth() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits {
            max_dispatch_depth: Some(2),
            current_dispatch_depth: 3,
            ..Default::default()
        });

        assert!(tracker.check_pre_dispatch(1).is_err());
    }

    #[test]
    fn test_unset_limits_are_unenforced() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits::default());
        assert!(tracker.check_pre_dispatch(10_000).is_ok());
        assert!(tracker.record_agent_completion(999.0, false, None).is_ok());
    }

    #[test]
    fn test_failure_rate_enforced_after_min_samples() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits {
            max_failure_rate: Some(0.5),
            ..Default::default()
        });

        // Four failures: below the 5-sample damping threshold, no breach.
        for _ in 0..4 {
            assert!(tracker.record_agent_completion(0.0, false, None).is_ok());
        }
        // Fifth completion crosses the threshold with rate 1.0 > 0.5.
        assert!(tracker.record_agent_completion(0.0, false, None).is_err());
    }

    #[test]
    fn test_cumulative_cost_breach() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits {
            max_total_cost_usd: Some(1.0),
            ..Default::default()
        });

        assert!(tracker.record_agent_completion(0.6, true, None).is_ok());
        assert!(tracker.record_agent_completion(0.6, true, None).is_err());
    }

    #[test]
    fn test_per_agent_duration_breach() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits {
            max_duration_per_agent_s: Some(1.0),
            ..Default::default()
        });

        assert!(tracker
            .record_agent_completion(0.0, true, Some(Duration::from_millis(500)))
            .is_ok());
        assert!(tracker
            .record_agent_completion(0.0, true, Some(Duration::from_secs(2)))
            .is_err());
    }

    #[tokio::test]
    async fn test_slot_gate_bounds_concurrency() {
        let tracker = Arc::new(DispatchLimitTracker::new(DispatchResourceLimits {
            max_concurrent: Some(1),
            ..Default::default()
        }));

        tracker.acquire_slot().await.unwrap();
        assert_eq!(tracker.get_stats().concurrent_count, 1);

        // Second acquire must block until the slot is released.
        let t2 = tracker.clone();
        let waiter = tokio::spawn(async move { t2.acquire_slot().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.release_slot();
        waiter.await.unwrap().unwrap();
        assert_eq!(tracker.get_stats().total_agents, 2);
    }

    #[test]
    fn test_stats_snapshot() {
        let tracker = DispatchLimitTracker::new(DispatchResourceLimits::default());
        tracker.record_agent_completion(0.25, true, None).unwrap();
        tracker.record_agent_completion(0.25, false, None).unwrap();

        let stats = tracker.get_stats();
        assert_eq!(stats.completed_agents, 2);
        assert_eq!(stats.failed_agents, 1);
        assert!((stats.total_cost - 0.5).abs() < f64::EPSILON);
    }
}
