//! Error types for Voxstream

use thiserror::Error;

/// Result type alias using Voxstream's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in Voxstream
///
/// Cloneable so an engine can retain its last error as an observable value
/// while also propagating it to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Microphone or recognizer access denied")]
    PermissionDenied,

    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error ({code:?}): {message}")]
    Server { code: Option<i64>, message: String },

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether a bounded retry is worth attempting for this error.
    ///
    /// Server codes in the 4xxx range are terminal (auth, quota, malformed
    /// request); retrying them would re-trip the same rejection. Everything
    /// transport-shaped is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailed(_) | Error::Timeout(_) => true,
            Error::Server { code, .. } => !matches!(code, Some(c) if (4000..5000).contains(c)),
            Error::PermissionDenied
            | Error::Unavailable(_)
            | Error::Protocol(_)
            | Error::Serialization(_) => false,
        }
    }
}

// serde_json::Error is not Clone, so carry its rendering instead of the source
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
