//! Plan type definitions.
//!
//! These types are designed to be planner-friendly: consistent patterns
//! that an LLM-backed planner can generate reliably.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A complete plan.
///
/// # Example JSON
///
/// ```json
/// {
///   "request_id": "req-123",
///   "steps": [
///     {"id": "extract_text", "tool": "ocr", "input": {"url": "https://..."}},
///     {"id": "parse_items", "tool": "parser",
///      "input": {"text": "step:extract_text"},
///      "depends_on": ["extract_text"]}
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Correlates the plan with the originating request.
    pub request_id: String,

    /// Steps in the plan (order is irrelevant; `depends_on` drives scheduling).
    pub steps: Vec<Step>,

    /// Optional final synthesis rendered from completed step outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_synthesis: Option<FinalSynthesis>,
}

/// Template for a closing synthesis prompt.
///
/// `{step_id}` placeholders are substituted with step outputs after the
/// plan completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSynthesis {
    pub prompt_template: String,
}

/// One unit of work bound to a tool, function, code-exec target, or remote
/// agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step id within the plan.
    pub id: String,

    /// Target name: a registered tool, `agent_*`, `function_call`, or
    /// `code_exec`.
    pub tool: String,

    /// Explicit step kind; `"agent"` forces delegation routing.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,

    /// Input map. Values may be literals, `"step:<id>"` references, or
    /// nested structures containing references.
    #[serde(default = "default_input")]
    pub input: Value,

    /// Steps that must complete before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Per-attempt deadline in seconds.
    #[serde(default)]
    pub timeout_s: Option<f64>,

    /// Stream this step, collecting ordered chunks.
    #[serde(default)]
    pub stream: bool,

    /// Per-chunk deadline in seconds for streaming steps.
    #[serde(default)]
    pub chunk_timeout_s: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub metadata: Value,
}

fn default_input() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Step {
    /// Whether this step is explicitly marked for agent delegation.
    pub fn is_agent(&self) -> bool {
        self.step_type.as_deref() == Some("agent")
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_s.map(Duration::from_secs_f64)
    }

    pub fn chunk_timeout(&self) -> Option<Duration> {
        self.chunk_timeout_s.map(Duration::from_secs_f64)
    }
}

/// Per-step retry configuration.
///
/// `retries` is the number of attempts *after* the first; the default of 0
/// means a single attempt. Backoff is linear: attempt `n` sleeps
/// `backoff_s * n` before retrying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_backoff_s")]
    pub backoff_s: f64,
}

fn default_backoff_s() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_s: default_backoff_s(),
        }
    }
}

impl Plan {
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Parse a plan from JSON text.
pub fn parse_plan(json: &str) -> Result<Plan> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_plan() {
        let plan = parse_plan(
            r#"{
                "request_id": "req-1",
                "steps": [
                    {"id": "a", "tool": "ocr", "input": {"url": "https://example.com/doc"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.request_id, "req-1");
        assert_eq!(plan.steps.len(), 1);

        let step = &plan.steps[0];
        assert_eq!(step.retry_policy.retries, 0);
        assert!((step.retry_policy.backoff_s - 1.0).abs() < f64::EPSILON);
        assert!(!step.stream);
        assert!(step.depends_on.is_empty());
    }

    #[test]
    fn test_parse_full_step() {
        let plan = parse_plan(
            r#"{
                "request_id": "req-2",
                "steps": [
                    {
                        "id": "summarize",
                        "tool": "agent_researcher",
                        "type": "agent",
                        "input": {"task": "summarize", "text": "step:extract"},
                        "depends_on": ["extract"],
                        "retry_policy": {"retries": 2, "backoff_s": 0.5},
                        "timeout_s": 30.0,
                        "stream": true,
                        "chunk_timeout_s": 5.0,
                        "idempotency_key": "sum-1"
                    },
                    {"id": "extract", "tool": "ocr"}
                ],
                "final_synthesis": {"prompt_template": "Combine: {summarize}"}
            }"#,
        )
        .unwrap();

        let step = plan.get_step("summarize").unwrap();
        assert!(step.is_agent());
        assert_eq!(step.retry_policy.retries, 2);
        assert_eq!(step.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(step.chunk_timeout(), Some(Duration::from_secs(5)));
        assert!(plan.final_synthesis.is_some());
    }
}
