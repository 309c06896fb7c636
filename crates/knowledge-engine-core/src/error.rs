//! Error taxonomy shared by every component.
//!
//! Provider failures are split by what the caller can do about them:
//! [`EngineError::ProviderTransient`] is worth retrying with backoff,
//! [`EngineError::ProviderQuota`] ends the current operation and should
//! prompt a switch to another provider, and [`EngineError::Configuration`]
//! is raised when a provider is activated, not in the middle of a batch.

use std::fmt;

/// Why a provider call failed in a way that may succeed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// HTTP 429 without a quota signal.
    RateLimited,
    /// Connection refused, reset, DNS failure.
    Network,
    /// The per-call deadline elapsed.
    Timeout,
    /// HTTP 5xx.
    Server,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::RateLimited => "rate limited",
            TransientKind::Network => "network error",
            TransientKind::Timeout => "timed out",
            TransientKind::Server => "server error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{provider} {kind}: {message}")]
    ProviderTransient {
        provider: String,
        kind: TransientKind,
        message: String,
    },

    #[error("{provider} quota exceeded: {message}")]
    ProviderQuota { provider: String, message: String },

    #[error("{provider} request failed: {message}")]
    Provider { provider: String, message: String },

    #[error("dimension mismatch: index holds {expected}-d vectors, got {actual}-d")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index consistency error: {0}")]
    IndexConsistency(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("a scan is already running")]
    ScanInProgress,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn transient(
        provider: impl Into<String>,
        kind: TransientKind,
        message: impl Into<String>,
    ) -> Self {
        EngineError::ProviderTransient {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// True only for failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ProviderTransient { .. })
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, EngineError::ProviderQuota { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(EngineError::transient("openai", TransientKind::RateLimited, "429").is_retryable());
        assert!(EngineError::transient("ollama", TransientKind::Timeout, "30s").is_retryable());
        assert!(!EngineError::ProviderQuota {
            provider: "openai".into(),
            message: "insufficient_quota".into(),
        }
        .is_retryable());
        assert!(!EngineError::Configuration("missing key".into()).is_retryable());
        assert!(!EngineError::DimensionMismatch {
            expected: 384,
            actual: 1536
        }
        .is_retryable());
    }

    #[test]
    fn quota_is_distinct() {
        let quota = EngineError::ProviderQuota {
            provider: "openai".into(),
            message: "billing".into(),
        };
        assert!(quota.is_quota());
        assert!(!EngineError::transient("openai", TransientKind::Server, "502").is_quota());
    }

    #[test]
    fn display_includes_dimensions() {
        let err = EngineError::DimensionMismatch {
            expected: 384,
            actual: 1536,
        };
        let msg = err.to_string();
        assert!(msg.contains("384"));
        assert!(msg.contains("1536"));
    }
}
