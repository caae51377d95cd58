//! Error taxonomy for the narrative engine.
//!
//! Uses thiserror for ergonomic error definition. The variants mirror how
//! failures propagate: NotFound/Unauthorized surface to the caller as-is,
//! Validation feeds retry loops, Upstream distinguishes transient provider
//! failures from permanent ones, and ToolExecution is contained to a single
//! tool call rather than aborting the turn.

use std::fmt;
use thiserror::Error;

/// Main error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A story, card, or other referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ownership check failed; distinct from NotFound.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed tool arguments or structured-output payload.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Embedding or LLM provider failure.
    #[error("upstream failure ({kind}): {message}")]
    Upstream {
        kind: UpstreamKind,
        message: String,
    },

    /// A single tool invocation failed; contained to that call.
    #[error("tool '{tool}' failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    /// Storage layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO failure (snapshot export/import).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What kind of upstream failure occurred. Timeout, rate limiting, and
/// network failures are retryable; API errors are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Timeout,
    RateLimited,
    Network,
    Api,
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpstreamKind::Timeout => "timeout",
            UpstreamKind::RateLimited => "rate-limited",
            UpstreamKind::Network => "network",
            UpstreamKind::Api => "api",
        };
        write!(f, "{name}")
    }
}

impl EngineError {
    /// Build a NotFound error for a named entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    /// Build an Upstream error with the given kind.
    pub fn upstream(kind: UpstreamKind, message: impl Into<String>) -> Self {
        EngineError::Upstream {
            kind,
            message: message.into(),
        }
    }

    /// Whether retrying this error could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Upstream {
                kind: UpstreamKind::Timeout | UpstreamKind::RateLimited | UpstreamKind::Network,
                ..
            }
        )
    }
}

impl From<claude::Error> for EngineError {
    fn from(error: claude::Error) -> Self {
        match error {
            claude::Error::Timeout => {
                EngineError::upstream(UpstreamKind::Timeout, "LLM request timed out")
            }
            claude::Error::RateLimited { message } => {
                EngineError::upstream(UpstreamKind::RateLimited, message)
            }
            claude::Error::Network(message) => {
                EngineError::upstream(UpstreamKind::Network, message)
            }
            claude::Error::Api { status, message } => EngineError::upstream(
                UpstreamKind::Api,
                format!("status {status}: {message}"),
            ),
            claude::Error::Parse(message) => EngineError::Validation(message),
            claude::Error::NoApiKey | claude::Error::Config(_) => {
                EngineError::Validation(error.to_string())
            }
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
