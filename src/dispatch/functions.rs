//! In-process collaborators: the function registry and the code sandbox
//! seam.
//!
//! Registration frameworks (decorators, plugin loaders) live outside this
//! crate; here a function is just a name bound to a synchronous callable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// A registered in-process function.
pub type RegisteredFunction = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Name → callable registry backing `function_call` steps.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `name`.
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted for stable error messages.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke a function by name.
    ///
    /// Unknown names produce an error listing the known functions; callable
    /// failures are wrapped with the function name.
    pub fn invoke(&self, name: &str, args: &Value) -> Result<Value> {
        let function = self.functions.get(name).ok_or_else(|| {
            Error::Function(format!(
                "unknown function '{}'. Registered functions: {:?}",
                name,
                self.names()
            ))
        })?;

        function(args).map_err(|e| match e {
            Error::Function(msg) => Error::Function(msg),
            other => Error::Function(format!("function '{name}' failed: {other}")),
        })
    }
}

/// Sandboxed code execution collaborator.
///
/// The sandbox itself is external; `code_exec` steps hand it the resolved
/// step input and take back whatever it produces.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, input: &Value) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register("double", |args: &Value| {
            let n = args
                .get("n")
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::Validation("missing numeric 'n'".into()))?;
            Ok(json!(n * 2.0))
        });
        registry
    }

    #[test]
    fn test_invoke_registered_function() {
        let result = registry().invoke("double", &json!({"n": 21})).unwrap();
        assert_eq!(result, json!(42.0));
    }

    #[test]
    fn test_unknown_function_lists_known_names() {
        let err = registry().invoke("triple", &json!({})).unwrap_err();
        assert_eq!(err.code(), "FUNCTION_ERROR");
        assert!(err.to_string().contains("double"));
    }

    #[test]
    fn test_callable_failure_is_wrapped() {
        let err = registry().invoke("double", &json!({})).unwrap_err();
        assert!(err.to_string().contains("double"));
        assert!(err.to_string().contains("missing numeric"));
    }
}
