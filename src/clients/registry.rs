//! Agent capability registry.
//!
//! Agents are declared in a YAML file loaded once at client construction:
//!
//! ```yaml
//! agents:
//!   - agent_id: researcher
//!     name: Research Agent
//!     endpoint: https://agents.example.com/research
//!     protocol: http
//!     capabilities: [search, summarize]
//!     tags: [external]
//!     metadata:
//!       auth:
//!         type: bearer
//!         token_env: RESEARCH_AGENT_TOKEN
//! ```
//!
//! `${VAR}` tokens are expanded from the environment at load time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Wire protocol an agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProtocol {
    Http,
    Sse,
    Websocket,
}

/// One registered remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub agent_id: String,
    pub name: String,
    pub endpoint: String,
    pub protocol: AgentProtocol,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl AgentCapability {
    /// Resolve the bearer token for this agent, if its metadata names one.
    ///
    /// Looks up `metadata.auth.token_env` and reads that environment
    /// variable at call time.
    pub fn bearer_token(&self) -> Option<String> {
        let auth = self.metadata.get("auth")?;
        if auth.get("type").and_then(Value::as_str) != Some("bearer") {
            return None;
        }
        let var = auth.get("token_env").and_then(Value::as_str)?;
        match std::env::var(var) {
            Ok(token) => Some(token),
            Err(_) => {
                warn!(agent_id = %self.agent_id, var, "bearer token env var not set");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    agents: Vec<AgentCapability>,
}

fn env_ref_regex() -> &'static Regex {
    static ENV_REF_REGEX: OnceLock<Regex> = OnceLock::new();
    ENV_REF_REGEX.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("valid regex"))
}

/// Expand `${VAR}` references from the environment.
///
/// Missing variables expand to the empty string with a warning.
fn expand_env_refs(input: &str) -> String {
    env_ref_regex()
        .replace_all(input, |caps: &regex_lite::Captures| {
            let var = &caps[1];
            std::env::var(var).unwrap_or_else(|_| {
                warn!(var, "registry references unset environment variable");
                String::new()
            })
        })
        .to_string()
}

/// Parse an agent registry from YAML text.
pub fn load_registry_str(yaml: &str) -> Result<HashMap<String, AgentCapability>> {
    let file: RegistryFile = serde_yaml::from_str(&expand_env_refs(yaml))?;

    let mut agents = HashMap::with_capacity(file.agents.len());
    for agent in file.agents {
        if agent.agent_id.is_empty() {
            return Err(Error::Config("registry entry with empty agent_id".into()));
        }
        if agent.endpoint.is_empty() {
            return Err(Error::Config(format!(
                "agent '{}' has an empty endpoint",
                agent.agent_id
            )));
        }
        if agents.insert(agent.agent_id.clone(), agent).is_some() {
            return Err(Error::Config("duplicate agent_id in registry".into()));
        }
    }
    Ok(agents)
}

/// Load an agent registry from a YAML file.
pub fn load_registry_path(path: impl AsRef<Path>) -> Result<HashMap<String, AgentCapability>> {
    let yaml = std::fs::read_to_string(path)?;
    load_registry_str(&yaml)
}
