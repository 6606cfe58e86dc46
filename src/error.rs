//! Error types for e6r.
//!
//! All errors are designed to be agent-friendly with structured information
//! that callers can parse and act upon: a stable `code()` string and an
//! [`ErrorCategory`] that drives retry decisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for e6r operations.
pub type Result<T> = std::result::Result<T, Error>;

/// e6r error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Misconfiguration: unknown agent id, malformed registry entry, bad
    /// client settings. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to a worker or remote agent.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A call (or a single stream chunk) exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The circuit breaker is open; the call was rejected without reaching
    /// the worker.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// A resource ceiling (cost, concurrency, failure rate, depth, duration)
    /// was breached. Fatal to the enclosing batch.
    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// The plan itself is defective: cycle, dangling dependency, stuck
    /// frontier. Indicates a planner bug, never retried.
    #[error("Plan error: {0}")]
    Plan(String),

    /// A plan step exhausted its attempts; the underlying failure is the
    /// source.
    #[error("Step '{step_id}' failed: {source}")]
    Step {
        step_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Invalid input to a component (bad token count, empty id, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A registered function rejected its arguments or failed.
    #[error("Function error: {0}")]
    Function(String),

    /// Stream protocol failure (bad frame, unexpected close).
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::Quota(_) => "QUOTA_EXCEEDED",
            Error::Plan(_) => "PLAN_ERROR",
            Error::Step { .. } => "STEP_FAILED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Function(_) => "FUNCTION_ERROR",
            Error::Stream(_) => "STREAM_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::WebSocket(_) => "WEBSOCKET_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Step { source, .. } => source.category(),
            Error::Config(_) | Error::Plan(_) | Error::Validation(_) | Error::Function(_) => {
                ErrorCategory::ClientError
            }
            Error::Transport(_)
            | Error::Timeout(_)
            | Error::Stream(_)
            | Error::Http(_)
            | Error::WebSocket(_)
            | Error::Io(_) => ErrorCategory::Transient,
            Error::CircuitOpen(_) => ErrorCategory::RateLimit,
            Error::Quota(_) | Error::Internal(_) | Error::Json(_) | Error::Yaml(_) => {
                ErrorCategory::Permanent
            }
        }
    }

    /// Whether another attempt of the same call could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::RateLimit
        )
    }

    /// Short classification string used in delegation failure responses.
    pub fn classify(&self) -> &'static str {
        match self {
            Error::Step { source, .. } => source.classify(),
            Error::Timeout(_) => "timeout",
            Error::Transport(_) | Error::Http(_) | Error::WebSocket(_) => "transport",
            Error::Stream(_) => "stream",
            Error::Json(_) => "decode",
            Error::Config(_) => "configuration",
            Error::CircuitOpen(_) => "circuit_open",
            Error::Quota(_) => "quota",
            _ => "error",
        }
    }
}

/// Standardized error categories for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid request or configuration. Do not retry without fixing it.
    ClientError,
    /// Transient failure - may succeed on retry.
    Transient,
    /// Unlikely to succeed on retry.
    Permanent,
    /// Admission control rejected the call - retry after the window.
    RateLimit,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::ClientError => write!(f, "client_error"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::RateLimit => write!(f, "rate_limit"),
        }
    }
}
