//! Error types for the cache engine.

use bytes::Bytes;

/// Cache engine errors.
///
/// Variants carry rendered messages rather than source errors so that a single
/// outcome can be cloned out to every coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Request URL could not be turned into a resource key.
    #[error("invalid resource url: {url} - {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Origin answered with a server error; status and body are passed through.
    #[error("upstream returned HTTP {status}")]
    Upstream { status: u16, body: Bytes },

    /// Origin could not be reached.
    #[error("network error: {message}")]
    Network { message: String },

    /// Local disk read/write failed.
    #[error("io error: {message}")]
    Io { message: String },

    /// Metadata index could not be loaded or saved.
    #[error("index error: {message}")]
    Index { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The fetch this request was coalesced onto went away without a result.
    #[error("coalesced fetch for {key} was abandoned")]
    Flight { key: String },
}

impl CacheError {
    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidUrl { .. } => 1,
            Self::Config { .. } => 1,

            // Origin side
            Self::Upstream { .. } => 3,
            Self::Network { .. } => 3,

            // Local side
            Self::Io { .. } => 4,
            Self::Index { .. } => 4,

            Self::Flight { .. } => 5,
        }
    }

    /// HTTP status the listener should answer with for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::InvalidUrl { .. } => 400,
            Self::Network { .. } => 502,
            _ => 500,
        }
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", context, err),
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
