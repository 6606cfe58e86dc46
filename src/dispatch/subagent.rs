//! Parallel sub-agent fan-out.
//!
//! Runs one prompt template against N argument sets with bounded
//! parallelism, independent of the DAG executor. Built directly on the
//! governance primitives: idempotency cache, token-bucket rate limiter,
//! and the resource-quota tracker.
//!
//! Per-task failures (timeouts, executor errors, bad templates) are
//! absorbed into the result record; only quota breaches and the
//! `min_success_count` shortfall fail the whole call.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::limits::{
    idempotency_key, DispatchLimitTracker, DispatchResourceLimits, DispatchStats,
    IdempotencyCache, RateLimiter, RecordStatus,
};
use crate::monitor::{MonitorSink, NullMonitor, SharedMonitor};

/// Prompt-injection sanitization collaborator (pure function).
pub trait PromptSanitizer: Send + Sync {
    fn sanitize(&self, template: &str) -> String;
}

/// PII response filtering collaborator (pure function).
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, value: Value) -> Value;
}

/// The executor a fan-out drives: one call per formatted prompt.
#[async_trait]
pub trait SubAgentExecutor: Send + Sync {
    async fn run(&self, prompt: &str, agent_name: &str, model: &str) -> Result<Value>;
}

/// Folds the ordered results into one aggregated value.
pub type AggregateFn = Arc<dyn Fn(&[SubAgentResult]) -> Value + Send + Sync>;

/// Settings for one fan-out call.
#[derive(Clone)]
pub struct SubAgentOptions {
    pub agent_name: String,
    pub model: String,
    pub max_parallel: usize,
    pub timeout_per_agent: Duration,
    pub limits: DispatchResourceLimits,
}

impl Default for SubAgentOptions {
    fn default() -> Self {
        Self {
            agent_name: "sub-agent".to_string(),
            model: "default".to_string(),
            max_parallel: 5,
            timeout_per_agent: Duration::from_secs(120),
            limits: DispatchResourceLimits::default(),
        }
    }
}

/// Outcome of one input argument set. Ordering matches the input.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentResult {
    pub index: usize,
    pub arguments: Value,
    pub output: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost: f64,
    pub duration_s: f64,
    pub cached: bool,
}

/// Whole-call outcome: per-input results plus tracker stats.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentOutcome {
    pub results: Vec<SubAgentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<Value>,
    pub stats: DispatchStats,
}

/// Fan-out dispatcher over one executor/template.
pub struct SubAgentDispatcher {
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<IdempotencyCache>,
    monitor: SharedMonitor,
    sanitizer: Option<Arc<dyn PromptSanitizer>>,
    response_filter: Option<Arc<dyn ResponseFilter>>,
}

/// Everything a spawned task needs, cloned per unique argument set.
#[derive(Clone)]
struct TaskSeed {
    template: String,
    agent_name: String,
    model: String,
    timeout_per_agent: Duration,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<IdempotencyCache>,
    tracker: Arc<DispatchLimitTracker>,
    semaphore: Arc<Semaphore>,
    monitor: SharedMonitor,
    response_filter: Option<Arc<dyn ResponseFilter>>,
    executor: Arc<dyn SubAgentExecutor>,
}

/// Result of one unique execution, before expansion to duplicate inputs.
struct TaskOutcome {
    output: Value,
    success: bool,
    error: Option<String>,
    cost: f64,
    duration_s: f64,
    cached: bool,
}

impl SubAgentDispatcher {
    pub fn new(rate_limiter: Arc<RateLimiter>, cache: Arc<IdempotencyCache>) -> Self {
        Self {
            rate_limiter,
            cache,
            monitor: Arc::new(NullMonitor),
            sanitizer: None,
            response_filter: None,
        }
    }

    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn PromptSanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn with_response_filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.response_filter = Some(filter);
        self
    }

    /// Fan one template out across `arguments`.
    ///
    /// Identical argument sets share one execution via the idempotency key.
    /// Returns one result per input, in input order, regardless of
    /// completion order. Fails as a whole only on quota breaches or a
    /// `min_success_count` shortfall.
    #[instrument(name = "subagent.dispatch", skip_all, fields(inputs = arguments.len(), agent = %opts.agent_name))]
    pub async fn dispatch(
        &self,
        template: &str,
        arguments: Vec<Value>,
        opts: &SubAgentOptions,
        executor: Arc<dyn SubAgentExecutor>,
        aggregate_fn: Option<AggregateFn>,
    ) -> Result<SubAgentOutcome> {
        let template = match &self.sanitizer {
            Some(sanitizer) => sanitizer.sanitize(template),
            None => template.to_string(),
        };

        let tracker = Arc::new(DispatchLimitTracker::new(opts.limits.clone()));
        tracker.check_pre_dispatch(arguments.len())?;

        // Group duplicate argument sets: each unique set executes once.
        let mut group_of_key: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Value, Vec<usize>)> = Vec::new();
        for (index, args) in arguments.iter().enumerate() {
            let key = idempotency_key(&opts.agent_name, &template, args);
            match group_of_key.get(&key) {
                Some(&group) => groups[group].2.push(index),
                None => {
                    group_of_key.insert(key.clone(), groups.len());
                    groups.push((key, args.clone(), vec![index]));
                }
            }
        }
        if groups.len() < arguments.len() {
            debug!(
                unique = groups.len(),
                total = arguments.len(),
                "deduplicated identical argument sets"
            );
        }

        // A per-dispatch admission rate overrides the shared limiter.
        let rate_limiter = match opts.limits.requests_per_second {
            Some(rps) => Arc::new(RateLimiter::new(rps)),
            None => self.rate_limiter.clone(),
        };

        let seed = TaskSeed {
            template,
            agent_name: opts.agent_name.clone(),
            model: opts.model.clone(),
            timeout_per_agent: opts.timeout_per_agent,
            rate_limiter,
            cache: self.cache.clone(),
            tracker: tracker.clone(),
            semaphore: Arc::new(Semaphore::new(opts.max_parallel.max(1))),
            monitor: self.monitor.clone(),
            response_filter: self.response_filter.clone(),
            executor,
        };

        let mut join_set: JoinSet<(usize, Result<TaskOutcome>)> = JoinSet::new();
        for (group_index, (key, args, _)) in groups.iter().enumerate() {
            let seed = seed.clone();
            let key = key.clone();
            let args = args.clone();
            join_set.spawn(async move { (group_index, run_task(seed, key, args).await) });
        }

        let mut group_outcomes: Vec<Option<TaskOutcome>> = Vec::new();
        group_outcomes.resize_with(groups.len(), || None);

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((group_index, Ok(outcome))) => group_outcomes[group_index] = Some(outcome),
                Ok((_, Err(e))) => {
                    // Quota breach: cancel siblings and fail the batch.
                    warn!(error = %e, "fan-out aborted by resource limits");
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(Error::Internal(format!("fan-out task panicked: {e}"))),
            }
        }

        // Expand unique executions back to one result per input, in order.
        let mut results: Vec<Option<SubAgentResult>> = Vec::new();
        results.resize_with(arguments.len(), || None);
        for ((_, args, indices), outcome) in groups.iter().zip(group_outcomes.into_iter()) {
            let outcome =
                outcome.ok_or_else(|| Error::Internal("fan-out task vanished".into()))?;
            for (occurrence, &index) in indices.iter().enumerate() {
                results[index] = Some(SubAgentResult {
                    index,
                    arguments: args.clone(),
                    output: outcome.output.clone(),
                    success: outcome.success,
                    error: outcome.error.clone(),
                    // Duplicates beyond the first ride along at zero cost.
                    cost: if occurrence == 0 { outcome.cost } else { 0.0 },
                    duration_s: if occurrence == 0 { outcome.duration_s } else { 0.0 },
                    cached: outcome.cached || occurrence > 0,
                });
            }
        }
        let results: Vec<SubAgentResult> = results.into_iter().map(Option::unwrap).collect();

        let successes = results.iter().filter(|r| r.success).count();
        let min_required = opts.limits.min_success_count;
        if min_required > 0 && successes < min_required {
            return Err(Error::Quota(format!(
                "only {successes} of {} sub-agents succeeded, below min_success_count={min_required}",
                results.len()
            )));
        }

        let aggregated = aggregate_fn.map(|f| f(&results));
        Ok(SubAgentOutcome {
            results,
            aggregated,
            stats: tracker.get_stats(),
        })
    }
}

/// Run one unique argument set through the full per-task flow.
///
/// Returns `Err` only for batch-fatal conditions (quota breaches); every
/// ordinary failure is folded into the `TaskOutcome`.
async fn run_task(seed: TaskSeed, key: String, args: Value) -> Result<TaskOutcome> {
    if let Some(hit) = seed.cache.get(&key) {
        debug!(key, "sub-agent result served from idempotency cache");
        seed.monitor
            .log_tool_call(&seed.agent_name, true, Duration::ZERO, None, None);
        return Ok(TaskOutcome {
            output: hit,
            success: true,
            error: None,
            cost: 0.0,
            duration_s: 0.0,
            cached: true,
        });
    }

    let _parallel_permit = seed
        .semaphore
        .acquire()
        .await
        .map_err(|_| Error::Internal("fan-out semaphore closed".into()))?;

    seed.tracker.acquire_slot().await?;
    if let Err(e) = seed.rate_limiter.acquire_one().await {
        seed.tracker.release_slot();
        return Err(e);
    }

    let prompt = match format_template(&seed.template, &args) {
        Ok(prompt) => prompt,
        Err(e) => {
            // Task-level error, never fatal to the batch.
            seed.tracker.release_slot();
            let message = e.to_string();
            seed.monitor
                .log_tool_call(&seed.agent_name, false, Duration::ZERO, Some(&message), None);
            return Ok(TaskOutcome {
                output: Value::Null,
                success: false,
                error: Some(message),
                cost: 0.0,
                duration_s: 0.0,
                cached: false,
            });
        }
    };

    let started = Instant::now();
    let outcome = timeout(
        seed.timeout_per_agent,
        seed.executor.run(&prompt, &seed.agent_name, &seed.model),
    )
    .await;
    let elapsed = started.elapsed();

    match outcome {
        Err(_) => {
            let completion = seed.tracker.record_agent_completion(0.0, false, Some(elapsed));
            seed.tracker.release_slot();
            seed.monitor
                .log_tool_call(&seed.agent_name, false, elapsed, Some("timeout"), None);
            completion?;
            Ok(TaskOutcome {
                output: json!("timeout"),
                success: false,
                error: Some("timeout".to_string()),
                cost: 0.0,
                duration_s: elapsed.as_secs_f64(),
                cached: false,
            })
        }
        Ok(Err(e)) => {
            let completion = seed.tracker.record_agent_completion(0.0, false, Some(elapsed));
            seed.tracker.release_slot();
            let message = e.to_string();
            seed.monitor
                .log_tool_call(&seed.agent_name, false, elapsed, Some(&message), None);
            completion?;
            Ok(TaskOutcome {
                output: Value::Null,
                success: false,
                error: Some(message),
                cost: 0.0,
                duration_s: elapsed.as_secs_f64(),
                cached: false,
            })
        }
        Ok(Ok(value)) => {
            let cost = value.get("cost").and_then(Value::as_f64).unwrap_or(0.0);
            let filtered = match &seed.response_filter {
                Some(filter) => filter.filter(value),
                None => value,
            };
            let completion = seed.tracker.record_agent_completion(cost, true, Some(elapsed));
            if let Err(e) = completion {
                seed.tracker.release_slot();
                return Err(e);
            }
            seed.cache.store(&key, filtered.clone(), RecordStatus::Success);
            seed.tracker.release_slot();
            seed.monitor
                .log_tool_call(&seed.agent_name, true, elapsed, None, None);
            Ok(TaskOutcome {
                output: filtered,
                success: true,
                error: None,
                cost,
                duration_s: elapsed.as_secs_f64(),
                cached: false,
            })
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("valid regex"))
}

/// Substitute `{key}` placeholders from an argument map.
///
/// Any placeholder left unfilled is an error naming the missing key.
fn format_template(template: &str, args: &Value) -> Result<String> {
    let map = args.as_object().ok_or_else(|| {
        Error::Validation("sub-agent arguments must be an object".to_string())
    })?;

    let mut rendered = template.to_string();
    for (key, value) in map {
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{key}}}"), &replacement);
    }

    if let Some(caps) = placeholder_regex().captures(&rendered) {
        return Err(Error::Validation(format!(
            "template placeholder '{{{}}}' has no matching argument",
            &caps[1]
        )));
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Echoes the prompt back and counts invocations.
    struct EchoExecutor {
        invocations: AtomicUsize,
    }

    impl EchoExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invocations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubAgentExecutor for EchoExecutor {
        async fn run(&self, prompt: &str, _agent_name: &str, _model: &str) -> Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"output": prompt}))
        }
    }

    /// Sleeps longer for earlier inputs so completion order inverts.
    struct StaggeredExecutor;

    #[async_trait]
    impl SubAgentExecutor for StaggeredExecutor {
        async fn run(&self, prompt: &str, _agent_name: &str, _model: &str) -> Result<Value> {
            let n: u64 = prompt
                .rsplit(' ')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            sleep(Duration::from_millis(60_u64.saturating_sub(n * 20))).await;
            Ok(json!({"output": n}))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl SubAgentExecutor for FailingExecutor {
        async fn run(&self, _prompt: &str, _agent_name: &str, _model: &str) -> Result<Value> {
            Err(Error::Transport("agent unavailable".into()))
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl SubAgentExecutor for SlowExecutor {
        async fn run(&self, _prompt: &str, _agent_name: &str, _model: &str) -> Result<Value> {
            sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    fn dispatcher() -> SubAgentDispatcher {
        SubAgentDispatcher::new(
            Arc::new(RateLimiter::with_burst(1000.0, 1000.0)),
            Arc::new(IdempotencyCache::new()),
        )
    }

    fn opts() -> SubAgentOptions {
        SubAgentOptions {
            agent_name: "researcher".into(),
            model: "test-model".into(),
            max_parallel: 4,
            timeout_per_agent: Duration::from_secs(2),
            limits: DispatchResourceLimits::default(),
        }
    }

    #[test]
    fn test_format_template() {
        let rendered = format_template("Hello {name}, {n} items", &json!({"name": "A", "n": 3}))
            .unwrap();
        assert_eq!(rendered, "Hello A, 3 items");
    }

    #[test]
    fn test_format_template_missing_placeholder() {
        let err = format_template("Hello {name}", &json!({"nom": "A"})).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        let outcome = dispatcher()
            .dispatch(
                "job {n}",
                vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})],
                &opts(),
                Arc::new(StaggeredExecutor),
                None,
            )
            .await
            .unwrap();

        // Completion order was inverted by the staggered delays.
        let outputs: Vec<u64> = outcome
            .results
            .iter()
            .map(|r| r.output["output"].as_u64().unwrap())
            .collect();
        assert_eq!(outputs, vec![0, 1, 2]);
        assert_eq!(outcome.results[2].index, 2);
    }

    #[tokio::test]
    async fn test_identical_arguments_execute_once() {
        let executor = EchoExecutor::new();
        let outcome = dispatcher()
            .dispatch(
                "Hello {name}",
                vec![json!({"name": "A"}), json!({"name": "A"})],
                &opts(),
                executor.clone(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(executor.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results[0].output, outcome.results[1].output);
        assert!(outcome.results[1].cached);
    }

    #[tokio::test]
    async fn test_cache_hit_is_zero_cost() {
        let cache = Arc::new(IdempotencyCache::new());
        let key = idempotency_key("researcher", "Hello {name}", &json!({"name": "A"}));
        cache.store(&key, json!({"output": "cached"}), RecordStatus::Success);

        let executor = EchoExecutor::new();
        let dispatcher = SubAgentDispatcher::new(
            Arc::new(RateLimiter::with_burst(1000.0, 1000.0)),
            cache,
        );
        let outcome = dispatcher
            .dispatch(
                "Hello {name}",
                vec![json!({"name": "A"})],
                &opts(),
                executor.clone(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(executor.invocations.load(Ordering::SeqCst), 0);
        let result = &outcome.results[0];
        assert!(result.cached);
        assert_eq!(result.cost, 0.0);
        assert_eq!(result.duration_s, 0.0);
        assert_eq!(result.output, json!({"output": "cached"}));
    }

    #[tokio::test]
    async fn test_timeout_becomes_task_result_not_error() {
        let mut options = opts();
        options.timeout_per_agent = Duration::from_millis(30);

        let outcome = dispatcher()
            .dispatch(
                "job {n}",
                vec![json!({"n": 1})],
                &options,
                Arc::new(SlowExecutor),
                None,
            )
            .await
            .unwrap();

        let result = &outcome.results[0];
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
        assert_eq!(result.output, json!("timeout"));
        assert_eq!(outcome.stats.failed_agents, 1);
    }

    #[tokio::test]
    async fn test_bad_template_is_task_level_error() {
        let outcome = dispatcher()
            .dispatch(
                "Hello {name}",
                vec![json!({"name": "ok"}), json!({"wrong": "key"})],
                &opts(),
                EchoExecutor::new(),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.results[0].success);
        assert!(!outcome.results[1].success);
        assert!(outcome.results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("name"));
    }

    #[tokio::test]
    async fn test_min_success_count_fails_whole_call() {
        let mut options = opts();
        options.limits.min_success_count = 1;

        let err = dispatcher()
            .dispatch(
                "job {n}",
                vec![json!({"n": 1}), json!({"n": 2})],
                &options,
                Arc::new(FailingExecutor),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn test_failure_rate_breach_aborts_batch() {
        let mut options = opts();
        options.limits.max_failure_rate = Some(0.5);
        options.limits.failure_rate_min_samples = 3;
        options.max_parallel = 1;

        let args: Vec<Value> = (0..6).map(|n| json!({"n": n})).collect();
        let err = dispatcher()
            .dispatch("job {n}", args, &options, Arc::new(FailingExecutor), None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn test_pre_dispatch_cost_ceiling() {
        let mut options = opts();
        options.limits.max_total_cost_usd = Some(0.1);
        options.limits.cost_per_agent_estimate = Some(0.06);

        let err = dispatcher()
            .dispatch(
                "job {n}",
                vec![json!({"n": 1}), json!({"n": 2})],
                &options,
                EchoExecutor::new(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn test_sanitizer_applied_to_template() {
        struct PrefixSanitizer;
        impl PromptSanitizer for PrefixSanitizer {
            fn sanitize(&self, template: &str) -> String {
                format!("[scrubbed] {template}")
            }
        }

        let outcome = dispatcher()
            .with_sanitizer(Arc::new(PrefixSanitizer))
            .dispatch(
                "greet {name}",
                vec![json!({"name": "a"})],
                &opts(),
                EchoExecutor::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.results[0].output["output"],
            json!("[scrubbed] greet a")
        );
    }

    #[tokio::test]
    async fn test_response_filter_applied_before_caching() {
        struct Redactor;
        impl ResponseFilter for Redactor {
            fn filter(&self, mut value: Value) -> Value {
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("output".to_string(), json!("[redacted]"));
                }
                value
            }
        }

        let cache = Arc::new(IdempotencyCache::new());
        let dispatcher = SubAgentDispatcher::new(
            Arc::new(RateLimiter::with_burst(1000.0, 1000.0)),
            cache.clone(),
        )
        .with_response_filter(Arc::new(Redactor));

        let outcome = dispatcher
            .dispatch(
                "greet {name}",
                vec![json!({"name": "a"})],
                &opts(),
                EchoExecutor::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.results[0].output, json!({"output": "[redacted]"}));

        // The cached copy is the filtered one.
        let key = idempotency_key("researcher", "greet {name}", &json!({"name": "a"}));
        assert_eq!(cache.get(&key), Some(json!({"output": "[redacted]"})));
    }

    #[tokio::test]
    async fn test_aggregate_fn() {
        let aggregate: AggregateFn =
            Arc::new(|results| json!(results.iter().filter(|r| r.success).count()));

        let outcome = dispatcher()
            .dispatch(
                "job {n}",
                vec![json!({"n": 1}), json!({"n": 2})],
                &opts(),
                EchoExecutor::new(),
                Some(aggregate),
            )
            .await
            .unwrap();

        assert_eq!(outcome.aggregated, Some(json!(2)));
    }
}
