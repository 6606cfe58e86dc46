//! Plan executor.
//!
//! Validates the plan, then repeatedly computes the ready frontier (steps
//! whose dependencies are all complete), launches the whole frontier
//! concurrently, and awaits it as a barrier. The first failure anywhere in
//! a batch aborts the whole plan - sibling steps are cancelled, not
//! drained. Per-step retries use linear backoff; the plan itself is never
//! retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::dispatch::HybridDispatcher;
use crate::error::{Error, Result};
use crate::monitor::{DispatchEvent, MonitorSink, NullMonitor, SharedMonitor};
use crate::plan::{validate_plan, Plan, Step};

/// Default per-attempt step deadline.
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a completed plan.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub request_id: String,
    pub execution_id: String,
    /// Every step's output, keyed by step id.
    pub step_outputs: HashMap<String, Value>,
    /// Rendered synthesis prompt, when the plan declared one.
    pub synthesis_prompt: Option<String>,
    pub duration: Duration,
}

/// Executes validated plans frontier by frontier.
pub struct PlanExecutor {
    dispatcher: Arc<HybridDispatcher>,
    monitor: SharedMonitor,
    default_step_timeout: Duration,
}

impl PlanExecutor {
    pub fn new(dispatcher: Arc<HybridDispatcher>) -> Self {
        Self {
            dispatcher,
            monitor: Arc::new(NullMonitor),
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Execute a plan to completion.
    ///
    /// Returns the full step-output context, or the first step failure
    /// wrapped with the failing step's id.
    #[instrument(
        name = "plan.execute",
        skip(self, plan),
        fields(request_id = %plan.request_id, execution_id = tracing::field::Empty)
    )]
    pub async fn execute(&self, plan: &Plan) -> Result<PlanOutcome> {
        validate_plan(plan)?;
        for step in &plan.steps {
            self.dispatcher.resolve_target(step)?;
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        Span::current().record("execution_id", execution_id.as_str());
        let started = Instant::now();

        info!(
            "Starting execution {} of plan '{}' ({} steps)",
            execution_id,
            plan.request_id,
            plan.steps.len()
        );
        self.monitor.on_event(DispatchEvent::PlanStarted {
            execution_id: execution_id.clone(),
            request_id: plan.request_id.clone(),
            step_count: plan.steps.len(),
        });

        let mut completed: HashMap<String, Value> = HashMap::new();
        let mut pending: Vec<Step> = plan.steps.clone();

        while !pending.is_empty() {
            let (ready, waiting): (Vec<Step>, Vec<Step>) = pending
                .into_iter()
                .partition(|s| s.depends_on.iter().all(|d| completed.contains_key(d)));

            if ready.is_empty() {
                let stuck: Vec<&str> = waiting.iter().map(|s| s.id.as_str()).collect();
                self.finish(&execution_id, plan, "failed", started);
                return Err(Error::Plan(format!(
                    "no ready steps while {:?} remain pending - dependency deadlock",
                    stuck
                )));
            }

            debug!(
                frontier = ready.len(),
                waiting = waiting.len(),
                "launching ready-step batch"
            );

            let mut join_set: JoinSet<(String, Result<Value>)> = JoinSet::new();
            for step in ready {
                let dispatcher = self.dispatcher.clone();
                let monitor = self.monitor.clone();
                let prior = completed.clone();
                let execution_id = execution_id.clone();
                let default_timeout = self.default_step_timeout;
                join_set.spawn(async move {
                    run_step(dispatcher, monitor, step, prior, execution_id, default_timeout).await
                });
            }

            // Barrier: the batch fully resolves before the next frontier is
            // computed. The first failure aborts the remaining siblings.
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((step_id, Ok(output))) => {
                        completed.insert(step_id, output);
                    }
                    Ok((step_id, Err(e))) => {
                        join_set.abort_all();
                        error!(step_id = %step_id, error = %e, "step failed, aborting plan");
                        self.finish(&execution_id, plan, "failed", started);
                        return Err(Error::Step {
                            step_id,
                            source: Box::new(e),
                        });
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        join_set.abort_all();
                        self.finish(&execution_id, plan, "failed", started);
                        return Err(Error::Internal(format!("step task panicked: {e}")));
                    }
                }
            }

            pending = waiting;
        }

        let synthesis_prompt = plan
            .final_synthesis
            .as_ref()
            .map(|s| render_synthesis(&s.prompt_template, &completed));

        let duration = started.elapsed();
        self.finish(&execution_id, plan, "completed", started);
        info!(
            "Execution {} completed ({} steps, {}ms)",
            execution_id,
            completed.len(),
            duration.as_millis()
        );

        Ok(PlanOutcome {
            request_id: plan.request_id.clone(),
            execution_id,
            step_outputs: completed,
            synthesis_prompt,
            duration,
        })
    }

    fn finish(&self, execution_id: &str, plan: &Plan, status: &str, started: Instant) {
        self.monitor.on_event(DispatchEvent::PlanFinished {
            execution_id: execution_id.to_string(),
            request_id: plan.request_id.clone(),
            status: status.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// Run one step with per-step retry.
///
/// Linear backoff between attempts (`backoff_s * attempt`); the last error
/// is surfaced after exhaustion. One monitor outcome is reported per step
/// regardless of how many attempts it took.
async fn run_step(
    dispatcher: Arc<HybridDispatcher>,
    monitor: SharedMonitor,
    step: Step,
    prior: HashMap<String, Value>,
    execution_id: String,
    default_timeout: Duration,
) -> (String, Result<Value>) {
    monitor.on_event(DispatchEvent::StepStarted {
        execution_id: execution_id.clone(),
        step_id: step.id.clone(),
        tool: step.tool.clone(),
    });

    let attempts = step.retry_policy.retries + 1;
    let backoff = Duration::from_secs_f64(step.retry_policy.backoff_s.max(0.0));
    let step_timeout = step.timeout().unwrap_or(default_timeout);
    let started = Instant::now();

    for attempt in 1..=attempts {
        let outcome = match timeout(step_timeout, dispatcher.dispatch(&step, &prior)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "step '{}' exceeded {:.1}s",
                step.id,
                step_timeout.as_secs_f64()
            ))),
        };

        match outcome {
            Ok(value) => {
                let latency = started.elapsed();
                monitor.log_tool_call(&step.tool, true, latency, None, Some(&execution_id));
                monitor.on_event(DispatchEvent::StepFinished {
                    execution_id,
                    step_id: step.id.clone(),
                    success: true,
                    duration_ms: latency.as_millis() as u64,
                    error: None,
                });
                return (step.id, Ok(value));
            }
            Err(e) if attempt < attempts && e.is_retryable() => {
                let delay = backoff.mul_f64(attempt as f64);
                warn!(
                    step_id = %step.id,
                    attempt,
                    attempts,
                    error = %e,
                    "step attempt failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
            }
            Err(e) => {
                let latency = started.elapsed();
                let message = e.to_string();
                monitor.log_tool_call(
                    &step.tool,
                    false,
                    latency,
                    Some(&message),
                    Some(&execution_id),
                );
                monitor.on_event(DispatchEvent::StepFinished {
                    execution_id,
                    step_id: step.id.clone(),
                    success: false,
                    duration_ms: latency.as_millis() as u64,
                    error: Some(message),
                });
                return (step.id, Err(e));
            }
        }
    }

    (
        step.id,
        Err(Error::Internal("step produced no outcome".into())),
    )
}

/// Render a synthesis template against completed step outputs.
///
/// `{step_id}` substitutes the step's output: strings verbatim, other
/// values as compact JSON. Unmatched placeholders are left untouched.
fn render_synthesis(template: &str, outputs: &HashMap<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (step_id, output) in outputs {
        let replacement = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{step_id}}}"), &replacement);
    }
    rendered
}
