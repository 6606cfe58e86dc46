//! e6r - Agent-first plan execution engine
//!
//! e6r executes declarative, multi-step tool/agent plans produced by an
//! external planner. It runs independent steps concurrently, respects step
//! dependencies, tolerates transient backend failures, and keeps fan-out to
//! unreliable remote agents inside explicit cost/concurrency budgets.
//!
//! ## Key Features
//!
//! - **DAG execution**: ready-step frontiers launch together and are
//!   awaited as a barrier; the first failure aborts the plan
//! - **Hybrid dispatch**: one step model routing to deterministic tools,
//!   remote agents (HTTP/SSE/WebSocket), in-process functions, or a code
//!   sandbox
//! - **Reliability envelope**: retries with backoff, circuit breaking,
//!   idempotent result caching, per-call and per-chunk timeouts
//! - **Governance**: token-bucket rate limiting and resource-quota
//!   tracking shared with the parallel sub-agent fan-out API
//!
//! ## Example Plan
//!
//! ```json
//! {
//!   "request_id": "receipt-42",
//!   "steps": [
//!     {"id": "extract_text", "tool": "ocr", "input": {"url": "https://..."}},
//!     {"id": "parse_items", "tool": "parser",
//!      "input": {"text": "step:extract_text"},
//!      "depends_on": ["extract_text"]}
//!   ]
//! }
//! ```

pub mod clients;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod limits;
pub mod monitor;
pub mod plan;
pub mod telemetry;

pub use error::{Error, Result};
