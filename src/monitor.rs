//! Dispatch monitoring.
//!
//! Components report lifecycle events to an injectable [`MonitorSink`].
//! Sink methods are infallible by contract, so a misbehaving observer can
//! never abort dispatch. A broadcast-channel implementation is provided for
//! live monitoring; [`NullMonitor`] discards everything.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Maximum number of events buffered in the broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Structured dispatch lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// Plan execution started
    PlanStarted {
        execution_id: String,
        request_id: String,
        step_count: usize,
    },
    /// Plan execution finished (either status)
    PlanFinished {
        execution_id: String,
        request_id: String,
        status: String,
        duration_ms: u64,
    },
    /// Step dispatch started
    StepStarted {
        execution_id: String,
        step_id: String,
        tool: String,
    },
    /// Step reached a terminal state
    StepFinished {
        execution_id: String,
        step_id: String,
        success: bool,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Tool call started
    ToolCallStarted { tool: String },
    /// Tool call completed successfully
    ToolCallCompleted { tool: String, duration_ms: u64 },
    /// Idempotent result served from cache without invoking the worker
    CacheHit { tool: String, key: String },
    /// Stream opened
    StreamStarted { tool: String },
    /// One stream chunk received
    StreamChunk { tool: String, index: usize },
    /// Stream drained to completion
    StreamCompleted { tool: String, chunks: usize },
    /// Remote delegation started
    DelegationStarted { agent_id: String },
    /// Remote delegation finished (either status)
    DelegationFinished {
        agent_id: String,
        success: bool,
        duration_ms: u64,
    },
    /// Aggregated per-step/per-task outcome (one per step regardless of retries)
    ToolOutcome {
        tool: String,
        success: bool,
        latency_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
}

/// Sink for dispatch telemetry.
///
/// `log_tool_call` is invoked exactly once per step/task regardless of how
/// many retry attempts it took. `on_event` receives the finer-grained
/// lifecycle stream and defaults to a no-op.
pub trait MonitorSink: Send + Sync {
    fn log_tool_call(
        &self,
        tool_name: &str,
        success: bool,
        latency: Duration,
        error: Option<&str>,
        execution_id: Option<&str>,
    );

    fn on_event(&self, _event: DispatchEvent) {}
}

/// Monitor that discards all events.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl MonitorSink for NullMonitor {
    fn log_tool_call(
        &self,
        _tool_name: &str,
        _success: bool,
        _latency: Duration,
        _error: Option<&str>,
        _execution_id: Option<&str>,
    ) {
    }
}

/// Broadcast-backed monitor for live observation.
///
/// Send errors (no subscribers) are ignored.
#[derive(Clone)]
pub struct ChannelMonitor {
    tx: broadcast::Sender<DispatchEvent>,
}

impl ChannelMonitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorSink for ChannelMonitor {
    fn log_tool_call(
        &self,
        tool_name: &str,
        success: bool,
        latency: Duration,
        error: Option<&str>,
        execution_id: Option<&str>,
    ) {
        let _ = self.tx.send(DispatchEvent::ToolOutcome {
            tool: tool_name.to_string(),
            success,
            latency_ms: latency.as_millis() as u64,
            error: error.map(str::to_string),
            execution_id: execution_id.map(str::to_string),
        });
    }

    fn on_event(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }
}

/// Convenience alias for the shared sink handle threaded through clients.
pub type SharedMonitor = Arc<dyn MonitorSink>;


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_monitor_broadcasts_events() {
        let monitor = ChannelMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.on_event(DispatchEvent::ToolCallStarted {
            tool: "ocr".to_string(),
        });

        match rx.recv().await.unwrap() {
            DispatchEvent::ToolCallStarted { tool } => assert_eq!(tool, "ocr"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_channel_monitor_without_subscribers_is_silent() {
        let monitor = ChannelMonitor::new();
        // No subscriber - must not panic or error.
        monitor.log_tool_call("ocr", true, Duration::from_millis(5), None, Some("exec-1"));
    }
}
