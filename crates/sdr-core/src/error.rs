use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Core error type for configuration and startup failures.
#[derive(Debug, Error)]
pub enum SdrError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SdrError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Malformed structured-mode envelope. The only failure surfaced to callers
/// as a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("structured request declares format \"json\" but no `fields` mapping")]
    MissingFields,
    #[error("structured request declares an empty `fields` mapping")]
    EmptyFields,
    #[error("invalid `fields` declaration: {0}")]
    InvalidFields(String),
}

/// Failure of a single tool invocation. Always absorbed into a `ToolResult`
/// with error status by the invoker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolInvocationError {
    #[error("tool timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("rate limited by backend: {0}")]
    RateLimited(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("call cancelled")]
    Cancelled,
}

impl ToolInvocationError {
    /// Transient failures are retried with backoff; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolInvocationError::Timeout(_)
                | ToolInvocationError::RateLimited(_)
                | ToolInvocationError::Network(_)
        )
    }

    /// Map a backend-reported error message (`{success: false, error}`) onto the taxonomy.
    pub fn from_backend_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("429")
            || lowered.contains("rate limit")
            || lowered.contains("too many requests")
        {
            ToolInvocationError::RateLimited(message)
        } else if lowered.contains("timed out") || lowered.contains("timeout") {
            ToolInvocationError::Network(message)
        } else if lowered.contains("401")
            || lowered.contains("403")
            || lowered.contains("unauthorized")
            || lowered.contains("forbidden")
        {
            ToolInvocationError::Unauthorized(message)
        } else if lowered.contains("not available") || lowered.contains("unknown tool") {
            ToolInvocationError::UnknownTool(message)
        } else if lowered.contains("invalid") || lowered.contains("validation") {
            ToolInvocationError::InvalidArguments(message)
        } else {
            ToolInvocationError::Backend(message)
        }
    }
}

/// Failure of the decision service. Timeouts and unavailability are retried by the loop.
#[derive(Debug, Clone, Error)]
pub enum DecisionError {
    #[error("decision service timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("decision service unavailable: {0}")]
    Unavailable(String),
    #[error("decision service rejected the request: {0}")]
    Rejected(String),
    #[error("decision service returned an unusable plan: {0}")]
    InvalidPlan(String),
}

impl DecisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DecisionError::Timeout(_) | DecisionError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_messages_map_to_taxonomy() {
        assert!(
            ToolInvocationError::from_backend_message("HTTP 429 Too Many Requests").is_transient()
        );
        assert!(
            ToolInvocationError::from_backend_message("Tool timed out after 30 seconds")
                .is_transient()
        );
        assert!(matches!(
            ToolInvocationError::from_backend_message("401 Unauthorized"),
            ToolInvocationError::Unauthorized(_)
        ));
        assert!(!ToolInvocationError::from_backend_message("profile not found").is_transient());
    }
}
