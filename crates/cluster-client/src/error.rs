//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the cluster API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists (create only)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// resourceVersion precondition failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// API server rejected the request
    #[error("API error ({code}): {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Server supplied message
        message: String,
    },

    /// Connection, TLS or other transport level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request did not complete within the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Local view is not usable yet (e.g. cache not synced)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Object could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request could not be built from the given object
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClusterError {
    /// Whether retrying the same request later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::Transport(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Api { code, .. } => *code == 429 || *code >= 500,
            Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::Serialization(_)
            | Self::InvalidRequest(_) => false,
        }
    }

    /// Whether the error means the object is gone
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        let message = err.to_string();
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(message),
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(message),
            kube::Error::Api(ae) => Self::Api { code: ae.code, message },
            kube::Error::SerdeError(_) => Self::InvalidRequest(message),
            _ => Self::Transport(message),
        }
    }
}
