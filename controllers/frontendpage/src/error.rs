//! Controller-specific error types.
//!
//! This module defines error types specific to the FrontendPage Controller
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use thiserror::Error;

/// Errors that can occur in the FrontendPage Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes client construction error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A child with our deterministic name is controlled by someone else
    #[error("Ownership conflict: {0}")]
    OwnershipConflict(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe or metrics server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Work was cancelled by shutdown or loss of leadership
    #[error("Cancelled")]
    Cancelled,
}

impl ControllerError {
    /// Whether the reconcile should be retried with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cluster(err) => err.is_transient(),
            Self::Kube(_) | Self::Watch(_) => true,
            Self::InvalidConfig(_)
            | Self::OwnershipConflict(_)
            | Self::Server(_)
            | Self::Metrics(_)
            | Self::Cancelled => false,
        }
    }

    /// Whether the error means the reconciled object no longer exists
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Cluster(err) if err.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ControllerError::Cluster(ClusterError::Timeout("get".into())).is_retryable());
        assert!(!ControllerError::Cluster(ClusterError::Api { code: 422, message: String::new() })
            .is_retryable());
        assert!(!ControllerError::OwnershipConflict("x".into()).is_retryable());
        assert!(ControllerError::Watch("x".into()).is_retryable());
        assert!(!ControllerError::Cancelled.is_retryable());
    }

    #[test]
    fn test_not_found() {
        assert!(ControllerError::Cluster(ClusterError::NotFound("x".into())).is_not_found());
        assert!(!ControllerError::Watch("x".into()).is_not_found());
    }
}
