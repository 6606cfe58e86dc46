//! Plan validation.
//!
//! Checks for:
//! - Required fields (request_id, steps)
//! - Unique, non-empty step ids
//! - Valid dependencies (referenced steps exist)
//! - No circular dependencies

use std::collections::{HashMap, HashSet};

use super::types::Plan;
use crate::error::{Error, Result};

/// Validate a plan's shape before execution.
pub fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.request_id.is_empty() {
        return Err(Error::Plan("plan request_id is required".into()));
    }
    if plan.steps.is_empty() {
        return Err(Error::Plan("plan must have at least one step".into()));
    }

    let mut ids = HashSet::new();
    for step in &plan.steps {
        if step.id.is_empty() {
            return Err(Error::Plan("step id cannot be empty".into()));
        }
        if step.tool.is_empty() {
            return Err(Error::Plan(format!("step '{}' has an empty tool", step.id)));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(Error::Plan(format!("duplicate step id: {}", step.id)));
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(Error::Plan(format!(
                    "step '{}' depends on non-existent step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    if has_cycle(plan) {
        return Err(Error::Plan("plan has circular dependencies".into()));
    }

    Ok(())
}

fn has_cycle(plan: &Plan) -> bool {
    fn dfs(
        step_id: &str,
        deps: &HashMap<&str, Vec<&str>>,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> bool {
        visited.insert(step_id.to_string());
        rec_stack.insert(step_id.to_string());

        if let Some(neighbors) = deps.get(step_id) {
            for neighbor in neighbors {
                if !visited.contains(*neighbor) {
                    if dfs(neighbor, deps, visited, rec_stack) {
                        return true;
                    }
                } else if rec_stack.contains(*neighbor) {
                    return true;
                }
            }
        }

        rec_stack.remove(step_id);
        false
    }

    let deps: HashMap<&str, Vec<&str>> = plan
        .steps
        .iter()
        .map(|s| {
            (
                s.id.as_str(),
                s.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    for step in &plan.steps {
        if !visited.contains(&step.id) && dfs(&step.id, &deps, &mut visited, &mut rec_stack) {
            return true;
        }
    }

    false
}
