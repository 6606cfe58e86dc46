//! Hybrid step routing.
//!
//! One plan step can target a deterministic tool, a remote agent, an
//! in-process function, or the code sandbox. Routing is a closed
//! [`StepTarget`] union resolved from the step's declaration - at
//! plan-validation time for early errors, and again at dispatch.
//!
//! The dispatcher is stateless with respect to plan progress; retries and
//! outcome reporting live upstream in the executor.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::functions::{CodeExecutor, FunctionRegistry};
use super::resolve::resolve_refs;
use crate::clients::{AgentClient, AgentDelegationRequest, ToolClient};
use crate::error::{Error, Result};
use crate::plan::Step;

/// Backend a step routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTarget {
    DeterministicTool,
    AgentDelegation,
    FunctionCall,
    CodeExec,
}

/// Routes one step to the right backend.
pub struct HybridDispatcher {
    tools: Arc<ToolClient>,
    agents: Option<Arc<AgentClient>>,
    functions: Arc<FunctionRegistry>,
    code_exec: Option<Arc<dyn CodeExecutor>>,
}

impl HybridDispatcher {
    pub fn new(tools: Arc<ToolClient>) -> Self {
        Self {
            tools,
            agents: None,
            functions: Arc::new(FunctionRegistry::new()),
            code_exec: None,
        }
    }

    pub fn with_agent_client(mut self, agents: Arc<AgentClient>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_code_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.code_exec = Some(executor);
        self
    }

    /// Resolve where a step routes.
    ///
    /// Checked once during plan validation so broken plans fail before any
    /// work starts.
    pub fn resolve_target(&self, step: &Step) -> Result<StepTarget> {
        if self.tools.has_tool(&step.tool) {
            return Ok(StepTarget::DeterministicTool);
        }

        if step.is_agent() || step.tool.starts_with("agent_") {
            return if self.agents.is_some() {
                Ok(StepTarget::AgentDelegation)
            } else {
                Err(Error::Config(format!(
                    "step '{}' targets agent delegation but no agent client is configured",
                    step.id
                )))
            };
        }

        if step.tool == "function_call" {
            return Ok(StepTarget::FunctionCall);
        }

        if step.tool == "code_exec" {
            return if self.code_exec.is_some() {
                Ok(StepTarget::CodeExec)
            } else {
                Err(Error::Config(format!(
                    "step '{}' targets code_exec but no code executor is configured",
                    step.id
                )))
            };
        }

        Err(Error::Validation(format!(
            "step '{}' targets unknown tool '{}'. Registered tools: {:?}, functions: {:?}",
            step.id,
            step.tool,
            self.tools.tool_names(),
            self.functions.names()
        )))
    }

    /// Dispatch one step against prior step outputs.
    pub async fn dispatch(&self, step: &Step, prior: &HashMap<String, Value>) -> Result<Value> {
        let resolved = resolve_refs(&step.input, prior);
        let target = self.resolve_target(step)?;
        debug!(step_id = %step.id, tool = %step.tool, ?target, "dispatching step");

        match target {
            StepTarget::DeterministicTool => {
                if step.stream {
                    let chunks = self
                        .tools
                        .call_stream(&step.tool, &resolved, step.timeout(), step.chunk_timeout())
                        .await?;
                    Ok(json!({ "chunks": chunks }))
                } else {
                    self.tools
                        .call(
                            &step.tool,
                            &resolved,
                            step.idempotency_key.as_deref(),
                            step.timeout(),
                        )
                        .await
                }
            }
            StepTarget::AgentDelegation => {
                let client = self.agents.as_ref().expect("checked by resolve_target");
                let request = build_delegation_request(step, &resolved, prior);
                if step.stream {
                    let chunks = client
                        .delegate_stream(&request, step.chunk_timeout())
                        .await?;
                    Ok(json!({ "chunks": chunks }))
                } else {
                    let response = client.delegate(&request).await?;
                    Ok(serde_json::to_value(response)?)
                }
            }
            StepTarget::FunctionCall => {
                let name = resolved
                    .get("function")
                    .or_else(|| resolved.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "function_call step '{}' requires a 'function' or 'name' input",
                            step.id
                        ))
                    })?;
                let args = resolved
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                self.functions.invoke(name, &args)
            }
            StepTarget::CodeExec => {
                let executor = self.code_exec.as_ref().expect("checked by resolve_target");
                executor.execute(&resolved).await
            }
        }
    }
}

/// Build the delegation request for an agent-routed step.
///
/// `task` falls back from the resolved input, to step metadata, to the
/// tool name. For explicit `type:"agent"` steps the context merges prior
/// outputs keyed by the step's input keys, overlaid by an inline `context`
/// map (inline wins).
fn build_delegation_request(
    step: &Step,
    resolved: &Value,
    prior: &HashMap<String, Value>,
) -> AgentDelegationRequest {
    let task = resolved
        .get("task")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            step.metadata
                .get("task")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| step.tool.clone());

    let context = if step.is_agent() {
        let mut merged = Map::new();
        if let Some(input) = step.input.as_object() {
            for key in input.keys() {
                if let Some(output) = prior.get(key) {
                    merged.insert(key.clone(), output.clone());
                }
            }
        }
        if let Some(inline) = resolved.get("context").and_then(Value::as_object) {
            for (key, value) in inline {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    } else {
        resolved
            .get("context")
            .cloned()
            .unwrap_or_else(|| resolved.clone())
    };

    AgentDelegationRequest {
        agent_id: agent_id_for(step),
        task,
        context,
        timeout_s: step.timeout_s,
        idempotency_key: step.idempotency_key.clone(),
        metadata: step.metadata.clone(),
    }
}

/// Derive the target agent id for an agent-routed step.
fn agent_id_for(step: &Step) -> String {
    if let Some(id) = step.metadata.get("agent_id").and_then(Value::as_str) {
        return id.to_string();
    }
    step.tool
        .strip_prefix("agent_")
        .unwrap_or(&step.tool)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ToolCallCache, ToolStream, ToolWorker};
    use crate::limits::{CircuitBreaker, IdempotencyCache};
    use async_trait::async_trait;

    struct EchoWorker;

    #[async_trait]
    impl ToolWorker for EchoWorker {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, payload: &Value) -> Result<Value> {
            Ok(json!({ "echoed": payload }))
        }

        async fn call_stream(&self, _payload: &Value) -> Result<ToolStream> {
            let stream = async_stream::stream! {
                yield Ok(json!("chunk-1"));
                yield Ok(json!("chunk-2"));
            };
            Ok(Box::pin(stream))
        }
    }

    struct FixedCodeExec;

    #[async_trait]
    impl CodeExecutor for FixedCodeExec {
        async fn execute(&self, input: &Value) -> Result<Value> {
            Ok(json!({ "exit_code": 0, "input": input }))
        }
    }

    fn tool_client() -> Arc<ToolClient> {
        let mut client = ToolClient::new(
            Arc::new(CircuitBreaker::new()),
            Arc::new(ToolCallCache::new()),
        );
        client.register(Arc::new(EchoWorker));
        Arc::new(client)
    }

    fn step(id: &str, tool: &str, input: Value) -> Step {
        Step {
            id: id.into(),
            tool: tool.into(),
            step_type: None,
            input,
            depends_on: vec![],
            retry_policy: Default::default(),
            timeout_s: None,
            stream: false,
            chunk_timeout_s: None,
            idempotency_key: None,
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_routes_to_registered_tool() {
        let dispatcher = HybridDispatcher::new(tool_client());
        let step = step("s1", "echo", json!({"x": 1}));

        assert_eq!(
            dispatcher.resolve_target(&step).unwrap(),
            StepTarget::DeterministicTool
        );
        let output = dispatcher.dispatch(&step, &HashMap::new()).await.unwrap();
        assert_eq!(output["echoed"]["x"], 1);
    }

    #[tokio::test]
    async fn test_refs_resolved_before_tool_call() {
        let dispatcher = HybridDispatcher::new(tool_client());
        let step = step("parse_items", "echo", json!({"text": "step:extract_text"}));

        let mut prior = HashMap::new();
        prior.insert("extract_text".to_string(), json!("ocr output"));

        let output = dispatcher.dispatch(&step, &prior).await.unwrap();
        // The worker saw the resolved text, never the literal reference.
        assert_eq!(output["echoed"]["text"], json!("ocr output"));
    }

    #[tokio::test]
    async fn test_stream_step_collects_chunks() {
        let dispatcher = HybridDispatcher::new(tool_client());
        let mut streaming = step("s1", "echo", json!({}));
        streaming.stream = true;

        let output = dispatcher.dispatch(&streaming, &HashMap::new()).await.unwrap();
        assert_eq!(output["chunks"], json!(["chunk-1", "chunk-2"]));
    }

    #[tokio::test]
    async fn test_function_call_routing() {
        let mut functions = FunctionRegistry::new();
        functions.register("concat", |args: &Value| {
            let a = args.get("a").and_then(Value::as_str).unwrap_or_default();
            let b = args.get("b").and_then(Value::as_str).unwrap_or_default();
            Ok(json!(format!("{a}{b}")))
        });
        let dispatcher =
            HybridDispatcher::new(tool_client()).with_functions(Arc::new(functions));

        let step = step(
            "s1",
            "function_call",
            json!({"function": "concat", "args": {"a": "foo", "b": "bar"}}),
        );
        let output = dispatcher.dispatch(&step, &HashMap::new()).await.unwrap();
        assert_eq!(output, json!("foobar"));
    }

    #[tokio::test]
    async fn test_unknown_function_is_clear_error() {
        let dispatcher = HybridDispatcher::new(tool_client());
        let step = step("s1", "function_call", json!({"function": "nope"}));

        let err = dispatcher.dispatch(&step, &HashMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "FUNCTION_ERROR");
        assert!(err.to_string().contains("unknown function"));
    }

    #[tokio::test]
    async fn test_code_exec_routing() {
        let dispatcher =
            HybridDispatcher::new(tool_client()).with_code_executor(Arc::new(FixedCodeExec));
        let step = step("s1", "code_exec", json!({"code": "print(1)"}));

        let output = dispatcher.dispatch(&step, &HashMap::new()).await.unwrap();
        assert_eq!(output["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_code_exec_without_executor_is_config_error() {
        let dispatcher = HybridDispatcher::new(tool_client());
        let step = step("s1", "code_exec", json!({}));

        let err = dispatcher.resolve_target(&step).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_tool_enumerates_known_names() {
        let mut functions = FunctionRegistry::new();
        functions.register("f1", |_| Ok(Value::Null));
        let dispatcher =
            HybridDispatcher::new(tool_client()).with_functions(Arc::new(functions));
        let step = step("s1", "mystery", json!({}));

        let err = dispatcher.resolve_target(&step).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("echo"));
        assert!(msg.contains("f1"));
    }

    #[test]
    fn test_agent_id_derivation() {
        let mut s = step("s1", "agent_researcher", json!({}));
        assert_eq!(agent_id_for(&s), "researcher");

        s.metadata = json!({"agent_id": "override"});
        assert_eq!(agent_id_for(&s), "override");
    }

    #[test]
    fn test_delegation_request_task_fallbacks() {
        let mut s = step("s1", "agent_researcher", json!({"task": "summarize"}));
        let resolved = resolve_refs(&s.input, &HashMap::new());
        let req = build_delegation_request(&s, &resolved, &HashMap::new());
        assert_eq!(req.task, "summarize");

        s.input = json!({});
        s.metadata = json!({"task": "from-metadata"});
        let resolved = resolve_refs(&s.input, &HashMap::new());
        let req = build_delegation_request(&s, &resolved, &HashMap::new());
        assert_eq!(req.task, "from-metadata");

        s.metadata = Value::Null;
        let req = build_delegation_request(&s, &resolved, &HashMap::new());
        assert_eq!(req.task, "agent_researcher");
    }

    #[test]
    fn test_agent_step_context_merge_inline_wins() {
        let mut s = step(
            "s1",
            "agent_researcher",
            json!({"extract": "step:extract", "context": {"extract": "inline", "extra": 1}}),
        );
        s.step_type = Some("agent".into());

        let mut prior = HashMap::new();
        prior.insert("extract".to_string(), json!("prior output"));

        let resolved = resolve_refs(&s.input, &prior);
        let req = build_delegation_request(&s, &resolved, &prior);

        // Inline context wins on the conflicting key; prior-merged keys remain.
        assert_eq!(req.context["extract"], json!("inline"));
        assert_eq!(req.context["extra"], 1);
    }
}
