//! Error Handling Module
//!
//! One typed error shared by all adapters and the orchestrator. Adapters
//! classify vendor failures into these variants and fix the `retryable`
//! semantics at classification time; the retry loop only reads them.

use std::time::Duration;

/// Unified gateway error.
///
/// Every variant classified from a vendor response carries the originating
/// provider name. The message is the vendor's own message where available.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    /// 401 from the vendor. Never retried.
    #[error("{message}")]
    Authentication { provider: String, message: String },

    /// 429 from the vendor, with the `retry-after` hint when present.
    #[error("{message}")]
    RateLimit {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// 503/529 from the vendor.
    #[error("{message}")]
    Overloaded { provider: String, message: String },

    /// 400 carrying a vendor context-length signal. The caller must shrink
    /// the input; retrying the same request cannot succeed.
    #[error("{message}")]
    ContextLength { provider: String, message: String },

    /// Any other vendor API error. Retryable iff the status is server-side.
    #[error("{message}")]
    Api {
        provider: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Transport-level failure (connect, send, read body).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Malformed vendor JSON on a non-streaming path.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Stream setup or transport failure before/while producing events.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Local misconfiguration (unknown provider, missing API key). Fails
    /// fast, never enters the retry loop.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The adapter has no endpoint for the requested operation.
    #[error("{0}")]
    Unsupported(String),

    /// The call was cancelled, externally or by the timeout watchdog.
    #[error("request cancelled")]
    Cancelled,
}

/// Error kind used to key the retry `on` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    Overloaded,
    ContextLength,
    Api,
    Network,
    Parse,
    Stream,
    Configuration,
    Unsupported,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Overloaded => "overloaded",
            Self::ContextLength => "context_length",
            Self::Api => "api",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Stream => "stream",
            Self::Configuration => "configuration",
            Self::Unsupported => "unsupported",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl AiError {
    /// The kind of this error, for retry-set membership.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::ContextLength { .. } => ErrorKind::ContextLength,
            Self::Api { .. } => ErrorKind::Api,
            Self::Http(_) => ErrorKind::Network,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Stream(_) => ErrorKind::Stream,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error may be retried. Set by classification, never
    /// recomputed by the orchestrator.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Overloaded { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Http(_) | Self::Stream(_) => true,
            Self::Authentication { .. }
            | Self::ContextLength { .. }
            | Self::Parse(_)
            | Self::Configuration(_)
            | Self::Unsupported(_)
            | Self::Cancelled => false,
        }
    }

    /// The originating provider, when the error was classified from a
    /// vendor response.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Authentication { provider, .. }
            | Self::RateLimit { provider, .. }
            | Self::Overloaded { provider, .. }
            | Self::ContextLength { provider, .. }
            | Self::Api { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Vendor `retry-after` hint, when one was supplied.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for AiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_matrix() {
        let rl = AiError::RateLimit {
            provider: "openai".into(),
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(rl.is_retryable());
        assert_eq!(rl.kind(), ErrorKind::RateLimit);
        assert_eq!(rl.retry_after(), Some(Duration::from_secs(2)));

        let auth = AiError::Authentication {
            provider: "openai".into(),
            message: "bad key".into(),
        };
        assert!(!auth.is_retryable());

        let client_side = AiError::Api {
            provider: "openai".into(),
            status: 404,
            code: None,
            message: "nope".into(),
        };
        assert!(!client_side.is_retryable());

        let server_side = AiError::Api {
            provider: "openai".into(),
            status: 502,
            code: None,
            message: "bad gateway".into(),
        };
        assert!(server_side.is_retryable());
        assert_eq!(server_side.provider(), Some("openai"));
    }

    #[test]
    fn message_is_vendor_verbatim() {
        let err = AiError::Overloaded {
            provider: "anthropic".into(),
            message: "Overloaded".into(),
        };
        assert_eq!(err.to_string(), "Overloaded");
    }
}
