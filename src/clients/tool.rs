//! Deterministic tool gateway.
//!
//! Fronts local, in-process workers with the reliability envelope remote
//! callers expect: bounded retries with exponential backoff, a shared
//! circuit breaker, per-call timeouts, and an idempotent result cache.
//!
//! Breaker and cache are injected (`Arc`) so that every client fronting the
//! same worker pool shares them - dedup and recovery are process-wide.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::limits::CircuitBreaker;
use crate::monitor::{DispatchEvent, MonitorSink, NullMonitor, SharedMonitor};

/// Ordered chunk stream produced by a streaming worker.
pub type ToolStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// A deterministic worker callable by name.
#[async_trait]
pub trait ToolWorker: Send + Sync {
    /// Registered tool name.
    fn name(&self) -> &str;

    /// Perform one call.
    async fn call(&self, payload: &Value) -> Result<Value>;

    /// Open a chunk stream for one call. Workers that do not stream keep
    /// the default.
    async fn call_stream(&self, payload: &Value) -> Result<ToolStream> {
        let _ = payload;
        Err(Error::Validation(format!(
            "tool '{}' does not support streaming",
            self.name()
        )))
    }
}

/// Retry/timeout settings for the tool gateway.
#[derive(Debug, Clone)]
pub struct ToolClientConfig {
    /// Additional attempts after the first (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Base backoff; attempt `n` sleeps `backoff * 2^n`.
    pub backoff: Duration,
    /// Default per-call deadline.
    pub timeout: Duration,
}

impl Default for ToolClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Default cache capacity (number of results).
const DEFAULT_CACHE_CAPACITY: u64 = 256;

/// Default per-entry time-to-live.
const DEFAULT_CACHE_TTL_SECS: u64 = 600;

/// Bounded idempotent result cache for deterministic tool calls.
///
/// LRU-evicting with a per-entry TTL; shared across clients by `Arc`.
pub struct ToolCallCache {
    cache: moka::sync::Cache<String, Value>,
}

impl ToolCallCache {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL_SECS)
    }

    pub fn with_config(max_capacity: u64, ttl_secs: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        Self { cache }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: &str, result: Value) {
        self.cache.insert(key.to_string(), result);
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for ToolCallCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Gateway to deterministic in-process workers.
pub struct ToolClient {
    workers: HashMap<String, Arc<dyn ToolWorker>>,
    circuit: Arc<CircuitBreaker>,
    cache: Arc<ToolCallCache>,
    monitor: SharedMonitor,
    config: ToolClientConfig,
}

impl ToolClient {
    pub fn new(circuit: Arc<CircuitBreaker>, cache: Arc<ToolCallCache>) -> Self {
        Self {
            workers: HashMap::new(),
            circuit,
            cache,
            monitor: Arc::new(NullMonitor),
            config: ToolClientConfig::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_config(mut self, config: ToolClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a worker under its own name.
    pub fn register(&mut self, worker: Arc<dyn ToolWorker>) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Registered tool names, sorted for stable error messages.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn worker(&self, name: &str) -> Result<&Arc<dyn ToolWorker>> {
        self.workers.get(name).ok_or_else(|| {
            Error::Config(format!(
                "unknown tool '{}'. Registered tools: {:?}",
                name,
                self.tool_names()
            ))
        })
    }

    /// Call a worker with the full reliability envelope.
    ///
    /// An idempotency hit returns the cached result with zero work. A
    /// failure that trips the breaker stops retrying immediately even if
    /// attempt budget remains; exhausted attempts re-raise the last error.
    pub async fn call(
        &self,
        name: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
        timeout_override: Option<Duration>,
    ) -> Result<Value> {
        let worker = self.worker(name)?;

        if let Some(key) = idempotency_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(tool = name, key, "idempotent cache hit");
                self.monitor.on_event(DispatchEvent::CacheHit {
                    tool: name.to_string(),
                    key: key.to_string(),
                });
                return Ok(hit);
            }
        }

        let call_timeout = timeout_override.unwrap_or(self.config.timeout);
        self.monitor.on_event(DispatchEvent::ToolCallStarted {
            tool: name.to_string(),
        });

        let started = Instant::now();
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            self.circuit.check()?;

            let outcome = timeout(call_timeout, worker.call(payload)).await;
            match outcome {
                Ok(Ok(value)) => {
                    self.circuit.record_success();
                    if let Some(key) = idempotency_key {
                        self.cache.insert(key, value.clone());
                    }
                    self.monitor.on_event(DispatchEvent::ToolCallCompleted {
                        tool: name.to_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return Ok(value);
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(Error::Timeout(format!(
                        "tool '{}' exceeded {:.1}s",
                        name,
                        call_timeout.as_secs_f64()
                    )));
                }
            }

            // Breaker opened mid-budget: stop retrying immediately.
            if self.circuit.record_failure() {
                break;
            }

            if attempt < self.config.max_retries {
                let delay = self.config.backoff * 2u32.saturating_pow(attempt);
                warn!(
                    tool = name,
                    attempt = attempt + 1,
                    error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "tool call failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("tool call produced no outcome".into())))
    }

    /// Streaming variant of [`call`](Self::call).
    ///
    /// Shares the retry/circuit envelope but is never idempotency-cached: a
    /// retried stream restarts from scratch and only the final successful
    /// attempt's chunks are returned, in order. `chunk_timeout` bounds each
    /// chunk wait independently of the overall deadline.
    pub async fn call_stream(
        &self,
        name: &str,
        payload: &Value,
        timeout_override: Option<Duration>,
        chunk_timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let worker = self.worker(name)?;
        let overall = timeout_override.unwrap_or(self.config.timeout);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            self.circuit.check()?;
            self.monitor.on_event(DispatchEvent::StreamStarted {
                tool: name.to_string(),
            });

            match self
                .drain_stream(worker.as_ref(), name, payload, overall, chunk_timeout)
                .await
            {
                Ok(chunks) => {
                    self.circuit.record_success();
                    self.monitor.on_event(DispatchEvent::StreamCompleted {
                        tool: name.to_string(),
                        chunks: chunks.len(),
                    });
                    return Ok(chunks);
                }
                Err(e) => last_error = Some(e),
            }

            if self.circuit.record_failure() {
                break;
            }

            if attempt < self.config.max_retries {
                let delay = self.config.backoff * 2u32.saturating_pow(attempt);
                warn!(tool = name, "stream attempt failed, restarting in {:?}", delay);
                sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("stream produced no outcome".into())))
    }

    /// Open and fully drain one stream attempt. Partial chunks from a
    /// failed attempt are dropped by the caller.
    async fn drain_stream(
        &self,
        worker: &dyn ToolWorker,
        name: &str,
        payload: &Value,
        overall: Duration,
        chunk_timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let deadline = Instant::now() + overall;

        let mut stream = timeout(overall, worker.call_stream(payload))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "tool '{}' stream did not open within {:.1}s",
                    name,
                    overall.as_secs_f64()
                ))
            })??;

        let mut chunks = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    Error::Timeout(format!(
                        "tool '{}' stream exceeded {:.1}s",
                        name,
                        overall.as_secs_f64()
                    ))
                })?;
            let wait = chunk_timeout.map_or(remaining, |c| c.min(remaining));

            match timeout(wait, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    self.monitor.on_event(DispatchEvent::StreamChunk {
                        tool: name.to_string(),
                        index: chunks.len(),
                    });
                    chunks.push(chunk);
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Ok(chunks),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "tool '{}' chunk {} timed out",
                        name,
                        chunks.len()
                    )))
                }
            }
        }
    }
}
