//! `"step:<id>"` reference resolution.
//!
//! Step inputs may reference prior step outputs by id. Resolution recurses
//! through nested maps and scans one level of lists. An unresolvable
//! reference becomes `null` rather than erroring - a deliberately
//! permissive policy so lenient planners keep working.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

const STEP_REF_PREFIX: &str = "step:";

/// Replace `"step:<id>"` references in `value` with outputs from `prior`.
pub fn resolve_refs(value: &Value, prior: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, prior),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_refs(v, prior)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => resolve_string(s, prior),
                    Value::Object(_) => resolve_refs(item, prior),
                    // Nested lists are not scanned.
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, prior: &HashMap<String, Value>) -> Value {
    match s.strip_prefix(STEP_REF_PREFIX) {
        Some(step_id) => prior.get(step_id).cloned().unwrap_or_else(|| {
            debug!(step_id, "unresolvable step reference, substituting null");
            Value::Null
        }),
        None => Value::String(s.to_string()),
    }
}
