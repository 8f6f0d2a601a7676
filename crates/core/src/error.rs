//! Error types shared across the engine

use thiserror::Error;

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error taxonomy.
///
/// Every failure crossing a component boundary is one of these kinds so
/// that callers can decide between retry, fallback, and surfacing without
/// downcasting provider-specific errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Backend is down, unreachable, or returned a server-side failure
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Backend throttled the request (HTTP 429 or SDK equivalent)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Deadline expired before the backend answered
    #[error("timed out: {0}")]
    Timeout(String),

    /// The request itself is malformed; retrying cannot help
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No pool entry available and the pool is at max size
    #[error("pool exhausted for {0}")]
    PoolExhausted(String),

    /// A cache tier's backing store is unreachable
    #[error("cache backend unavailable: {0}")]
    CacheBackendUnavailable(String),

    /// Audio buffer refused a chunk at capacity
    #[error("audio buffer overflow")]
    BufferOverflow,

    /// No streaming session registered for the call
    #[error("session not found for call {0}")]
    SessionNotFound(String),

    /// The session was terminated before or during the operation
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    /// Carrier acknowledged the request and refused it
    #[error("carrier rejected: {0}")]
    CarrierRejected(String),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller may retry (possibly on a fallback provider).
    ///
    /// `InvalidInput` and `Config` are permanent; everything transient
    /// around providers is fair game for the fallback controller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable(_) | Error::RateLimited(_) | Error::Timeout(_)
        )
    }

    /// Stable kind label used in stats and persisted metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::RateLimited(_) => "rate_limited",
            Error::Timeout(_) => "timeout",
            Error::InvalidInput(_) => "invalid_input",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::CacheBackendUnavailable(_) => "cache_backend_unavailable",
            Error::BufferOverflow => "buffer_overflow",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionTerminated(_) => "session_terminated",
            Error::CarrierRejected(_) => "carrier_rejected",
            Error::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Timeout("deadline".into()).is_retryable());
        assert!(Error::RateLimited("429".into()).is_retryable());
        assert!(Error::ProviderUnavailable("down".into()).is_retryable());
        assert!(!Error::InvalidInput("empty text".into()).is_retryable());
        assert!(!Error::BufferOverflow.is_retryable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::BufferOverflow.kind(), "buffer_overflow");
        assert_eq!(Error::Config("x".into()).kind(), "config_error");
    }
}
