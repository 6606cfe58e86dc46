//! Remote agent delegation client.
//!
//! Treats autonomous remote agents as callable tools: a registry of
//! capabilities, idempotent delegation with retry/backoff under one overall
//! deadline, and streaming over three wire protocols (HTTP chunked, SSE,
//! WebSocket).
//!
//! Delegation failures after retries are *returned* as typed
//! `success=false` responses rather than raised, so a caller fanning out
//! across many agents can handle each outcome gracefully.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

use super::registry::{load_registry_path, load_registry_str, AgentCapability, AgentProtocol};
use super::sse::{data_lines, SseBuffer};
use super::tool::ToolStream;
use crate::error::{Error, Result};
use crate::limits::{IdempotencyCache, RecordStatus};
use crate::monitor::{DispatchEvent, MonitorSink, NullMonitor, SharedMonitor};

/// Retry/timeout settings for delegation.
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Base backoff; attempt `n` sleeps `backoff * 2^n`.
    pub backoff: Duration,
    /// Overall deadline when the request does not carry one.
    pub default_timeout: Duration,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
            default_timeout: Duration::from_secs(60),
        }
    }
}

/// One delegation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDelegationRequest {
    pub agent_id: String,
    pub task: String,
    #[serde(default)]
    pub context: Value,
    /// Overall deadline in seconds for the whole retry sequence.
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Outcome of one delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDelegationResponse {
    pub success: bool,
    pub result: Value,
    /// Wall-clock seconds spent (0.0 for cache hits).
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Client for remote agent delegation.
pub struct AgentClient {
    agents: HashMap<String, AgentCapability>,
    http: reqwest::Client,
    cache: Arc<IdempotencyCache>,
    monitor: SharedMonitor,
    config: AgentClientConfig,
}

impl AgentClient {
    /// Build a client over an already-loaded registry.
    pub fn new(agents: Vec<AgentCapability>, cache: Arc<IdempotencyCache>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|a| (a.agent_id.clone(), a))
                .collect(),
            http: reqwest::Client::new(),
            cache,
            monitor: Arc::new(NullMonitor),
            config: AgentClientConfig::default(),
        }
    }

    /// Build a client from registry YAML text.
    pub fn from_yaml(yaml: &str, cache: Arc<IdempotencyCache>) -> Result<Self> {
        let agents = load_registry_str(yaml)?;
        Ok(Self {
            agents,
            http: reqwest::Client::new(),
            cache,
            monitor: Arc::new(NullMonitor),
            config: AgentClientConfig::default(),
        })
    }

    /// Build a client from a registry YAML file.
    pub fn from_path(path: impl AsRef<Path>, cache: Arc<IdempotencyCache>) -> Result<Self> {
        let agents = load_registry_path(path)?;
        Ok(Self {
            agents,
            http: reqwest::Client::new(),
            cache,
            monitor: Arc::new(NullMonitor),
            config: AgentClientConfig::default(),
        })
    }

    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_config(mut self, config: AgentClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Test seam: inject an agent after construction.
    #[cfg(test)]
    pub(crate) fn insert_agent(&mut self, agent: AgentCapability) {
        self.agents.insert(agent.agent_id.clone(), agent);
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentCapability> {
        self.agents.get(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Filter registered agents by capability and/or tags (membership).
    pub fn discover(&self, capability: Option<&str>, tags: &[&str]) -> Vec<&AgentCapability> {
        let mut found: Vec<&AgentCapability> = self
            .agents
            .values()
            .filter(|agent| {
                capability.map_or(true, |c| agent.capabilities.iter().any(|have| have == c))
                    && tags
                        .iter()
                        .all(|t| agent.tags.iter().any(|have| have == t))
            })
            .collect();
        found.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        found
    }

    fn agent(&self, agent_id: &str) -> Result<&AgentCapability> {
        self.agents.get(agent_id).ok_or_else(|| {
            Error::Config(format!(
                "unknown agent '{}'. Registered agents: {:?}",
                agent_id,
                self.agent_ids()
            ))
        })
    }

    /// Delegate a task to a remote agent.
    ///
    /// Transient failures retry with exponential backoff; the entire retry
    /// sequence is bounded by one overall deadline whose expiry raises a
    /// timeout. Definitive failure after retries comes back as a
    /// `success=false` response with a classified `error_type`.
    #[instrument(name = "agent.delegate", skip(self, request), fields(agent_id = %request.agent_id))]
    pub async fn delegate(&self, request: &AgentDelegationRequest) -> Result<AgentDelegationResponse> {
        let agent = self.agent(&request.agent_id)?;

        if let Some(key) = &request.idempotency_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(key, "delegation served from idempotency cache");
                return Ok(AgentDelegationResponse {
                    success: true,
                    result: hit,
                    execution_time: 0.0,
                    cost: None,
                    error: None,
                    error_type: None,
                    metadata: json!({"cached": true}),
                });
            }
        }

        let overall = request
            .timeout_s
            .map(Duration::from_secs_f64)
            .unwrap_or(self.config.default_timeout);

        self.monitor.on_event(DispatchEvent::DelegationStarted {
            agent_id: agent.agent_id.clone(),
        });
        let started = Instant::now();

        let outcome = timeout(overall, self.delegate_with_retries(agent, request)).await;
        let execution_time = started.elapsed().as_secs_f64();

        match outcome {
            Err(_) => {
                self.monitor.on_event(DispatchEvent::DelegationFinished {
                    agent_id: agent.agent_id.clone(),
                    success: false,
                    duration_ms: (execution_time * 1000.0) as u64,
                });
                Err(Error::Timeout(format!(
                    "delegation to '{}' exceeded {:.1}s",
                    agent.agent_id,
                    overall.as_secs_f64()
                )))
            }
            Ok(Ok(result)) => {
                if let Some(key) = &request.idempotency_key {
                    self.cache.store(key, result.clone(), RecordStatus::Success);
                }
                let cost = result.get("cost").and_then(Value::as_f64);
                self.monitor.on_event(DispatchEvent::DelegationFinished {
                    agent_id: agent.agent_id.clone(),
                    success: true,
                    duration_ms: (execution_time * 1000.0) as u64,
                });
                Ok(AgentDelegationResponse {
                    success: true,
                    result,
                    execution_time,
                    cost,
                    error: None,
                    error_type: None,
                    metadata: json!({}),
                })
            }
            Ok(Err(e)) => {
                warn!(agent_id = %agent.agent_id, error = %e, "delegation failed after retries");
                self.monitor.on_event(DispatchEvent::DelegationFinished {
                    agent_id: agent.agent_id.clone(),
                    success: false,
                    duration_ms: (execution_time * 1000.0) as u64,
                });
                Ok(AgentDelegationResponse {
                    success: false,
                    result: Value::Null,
                    execution_time,
                    cost: None,
                    error: Some(e.to_string()),
                    error_type: Some(e.classify().to_string()),
                    metadata: json!({}),
                })
            }
        }
    }

    async fn delegate_with_retries(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
    ) -> Result<Value> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.post_delegation(agent, request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    warn!(
                        agent_id = %agent.agent_id,
                        attempt = attempt + 1,
                        error = %e,
                        "delegation attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        sleep(self.config.backoff * 2u32.saturating_pow(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Internal("delegation produced no outcome".into())))
    }

    fn build_post(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
    ) -> reqwest::RequestBuilder {
        let body = json!({
            "task": request.task,
            "context": request.context,
            "metadata": request.metadata,
        });
        let mut builder = self.http.post(&agent.endpoint).json(&body);
        if let Some(token) = agent.bearer_token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn post_delegation(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
    ) -> Result<Value> {
        let response = self
            .build_post(agent, request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&agent.agent_id, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "agent '{}' returned HTTP {}: {}",
                agent.agent_id,
                status.as_u16(),
                truncate(&body, 200)
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(&agent.agent_id, e))?;
        serde_json::from_str(&text).map_err(Error::from)
    }

    /// Streaming delegation over the agent's wire protocol.
    ///
    /// A per-chunk timeout failure discards the whole attempt (including
    /// chunks already collected) and the next retry restarts the stream
    /// from the top. Only the final successful attempt's chunks are
    /// returned, in order. The overall deadline bounds the entire retry
    /// sequence and raises a timeout on expiry.
    #[instrument(name = "agent.delegate_stream", skip(self, request), fields(agent_id = %request.agent_id))]
    pub async fn delegate_stream(
        &self,
        request: &AgentDelegationRequest,
        chunk_timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let agent = self.agent(&request.agent_id)?;
        let overall = request
            .timeout_s
            .map(Duration::from_secs_f64)
            .unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + overall;
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| stream_deadline_error(agent, overall))?;

            self.monitor.on_event(DispatchEvent::StreamStarted {
                tool: agent.agent_id.clone(),
            });

            let outcome = timeout(
                remaining,
                self.open_and_drain(agent, request, chunk_timeout),
            )
            .await;

            match outcome {
                Err(_) => return Err(stream_deadline_error(agent, overall)),
                Ok(Ok(chunks)) => {
                    self.monitor.on_event(DispatchEvent::StreamCompleted {
                        tool: agent.agent_id.clone(),
                        chunks: chunks.len(),
                    });
                    return Ok(chunks);
                }
                Ok(Err(e)) if e.is_retryable() && attempt < self.config.max_retries => {
                    warn!(
                        agent_id = %agent.agent_id,
                        attempt = attempt + 1,
                        error = %e,
                        "stream attempt failed, restarting"
                    );
                    last_error = Some(e);
                    let delay = self.config.backoff * 2u32.saturating_pow(attempt);
                    sleep(delay.min(remaining)).await;
                }
                Ok(Err(e)) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("stream produced no outcome".into())))
    }

    /// Open one stream attempt and drain it to completion.
    async fn open_and_drain(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
        chunk_timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let mut stream = match agent.protocol {
            AgentProtocol::Http => self.open_http_stream(agent, request).await?,
            AgentProtocol::Sse => self.open_sse_stream(agent, request).await?,
            AgentProtocol::Websocket => self.open_ws_stream(agent, request).await?,
        };

        let mut chunks = Vec::new();
        loop {
            let next = match chunk_timeout {
                Some(limit) => match timeout(limit, stream.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        return Err(Error::Timeout(format!(
                            "agent '{}' chunk {} timed out after {:.1}s",
                            agent.agent_id,
                            chunks.len(),
                            limit.as_secs_f64()
                        )))
                    }
                },
                None => stream.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    self.monitor.on_event(DispatchEvent::StreamChunk {
                        tool: agent.agent_id.clone(),
                        index: chunks.len(),
                    });
                    chunks.push(chunk);
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(chunks),
            }
        }
    }

    /// HTTP chunked transfer: each body chunk is one logical chunk.
    async fn open_http_stream(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
    ) -> Result<ToolStream> {
        let response = self
            .build_post(agent, request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&agent.agent_id, e))?;
        check_stream_status(agent, &response)?;

        let agent_id = agent.agent_id.clone();
        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| Error::Transport(format!("agent '{agent_id}' stream read: {e}")))?;
                let text = String::from_utf8_lossy(&chunk);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                yield parse_chunk(trimmed);
            }
        };
        Ok(Box::pin(stream))
    }

    /// SSE: `data: <line>` payloads inside blank-line-delimited frames.
    async fn open_sse_stream(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
    ) -> Result<ToolStream> {
        let response = self
            .build_post(agent, request)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| map_reqwest_error(&agent.agent_id, e))?;
        check_stream_status(agent, &response)?;

        let agent_id = agent.agent_id.clone();
        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer = SseBuffer::new();
            let mut done = false;
            while !done {
                let Some(chunk) = bytes.next().await else { break };
                let chunk = chunk
                    .map_err(|e| Error::Transport(format!("agent '{agent_id}' stream read: {e}")))?;
                buffer.push_chunk(&chunk);
                while let Some(block) = buffer.next_event_block() {
                    for line in data_lines(&block) {
                        if line == "[DONE]" {
                            done = true;
                            break;
                        }
                        yield parse_chunk(line);
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// WebSocket: the request is sent as the first text frame, then each
    /// incoming text frame is one logical chunk until close.
    async fn open_ws_stream(
        &self,
        agent: &AgentCapability,
        request: &AgentDelegationRequest,
    ) -> Result<ToolStream> {
        use tokio_tungstenite::tungstenite::Message;

        let url = ws_endpoint(&agent.endpoint);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        let body = json!({
            "task": request.task,
            "context": request.context,
            "metadata": request.metadata,
        });
        write.send(Message::Text(body.to_string())).await?;

        let stream = async_stream::try_stream! {
            while let Some(frame) = read.next().await {
                let frame = frame.map_err(Error::from)?;
                match frame {
                    Message::Text(text) => yield parse_chunk(&text),
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Parse a wire chunk: JSON when it decodes, raw string otherwise.
fn parse_chunk(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Map `http(s)` endpoints onto `ws(s)`; `ws(s)` passes through.
fn ws_endpoint(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}

fn check_stream_status(agent: &AgentCapability, response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Transport(format!(
            "agent '{}' returned HTTP {} opening stream",
            agent.agent_id,
            status.as_u16()
        )))
    }
}

fn stream_deadline_error(agent: &AgentCapability, overall: Duration) -> Error {
    Error::Timeout(format!(
        "streaming delegation to '{}' exceeded {:.1}s",
        agent.agent_id,
        overall.as_secs_f64()
    ))
}

fn map_reqwest_error(agent_id: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("agent '{agent_id}' request timed out: {e}"))
    } else {
        Error::Transport(format!("agent '{agent_id}' request failed: {e}"))
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
