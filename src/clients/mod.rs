//! Transport clients.
//!
//! [`ToolClient`] fronts deterministic in-process workers with retry,
//! circuit-breaking and idempotent caching. [`AgentClient`] delegates work
//! to remote agents over HTTP, SSE or WebSocket.

mod agent;
mod registry;
mod sse;
mod tool;

pub use agent::{AgentClient, AgentClientConfig, AgentDelegationRequest, AgentDelegationResponse};
pub use registry::{load_registry_path, load_registry_str, AgentCapability, AgentProtocol};
pub use sse::SseBuffer;
pub use tool::{ToolCallCache, ToolClient, ToolClientConfig, ToolStream, ToolWorker};
