//! Error types for the Rivven Pub/Sub operator

use thiserror::Error;

/// Errors that can occur while reconciling pull subscriptions
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Status write lost an optimistic-concurrency race
    #[error("Conflicting update on {0}")]
    Conflict(String),

    /// Sink or transformer reference does not exist
    #[error("{0}")]
    ReferenceNotFound(String),

    /// Sink or transformer exists but has no address yet
    #[error("{0}")]
    ReferenceNotReady(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Spec failed structural validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Pub/Sub admin client could not be created
    #[error("Failed to create Pub/Sub client: {0}")]
    ClientCreate(String),

    /// Topic is missing on the Pub/Sub side
    #[error("Topic {0:?} does not exist")]
    TopicNotFound(String),

    /// Remote Pub/Sub call failed
    #[error("{0}")]
    Messaging(String),

    /// Subscription teardown failed
    #[error("Failed to delete Pub/Sub subscription: {0}")]
    SubscriptionDelete(String),

    /// Receive adapter or autoscaler binding could not be reconciled
    #[error("Failed to reconcile Data Plane resource(s): {0}")]
    DataPlane(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    ///
    /// Every failure heals once the underlying condition resolves, so all
    /// variants go back through the requeue path.
    pub fn is_retryable(&self) -> bool {
        true
    }

    /// Status write conflicts are retried immediately against fresh state
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict(_) => true,
            OperatorError::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            OperatorError::KubeError(_) => "kube",
            OperatorError::Conflict(_) => "conflict",
            OperatorError::ReferenceNotFound(_) | OperatorError::ReferenceNotReady(_) => {
                "reference"
            }
            OperatorError::InvalidConfig(_) | OperatorError::ValidationError(_) => "config",
            OperatorError::ClientCreate(_)
            | OperatorError::TopicNotFound(_)
            | OperatorError::Messaging(_) => "messaging",
            OperatorError::SubscriptionDelete(_) => "delete",
            OperatorError::DataPlane(_) => "dataplane",
            OperatorError::SerializationError(_) => "serialization",
            OperatorError::FinalizerError(_) => "finalizer",
            OperatorError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::TopicNotFound("orders".to_string());
        assert_eq!(err.to_string(), "Topic \"orders\" does not exist");

        let err = OperatorError::SubscriptionDelete("permission denied".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to delete Pub/Sub subscription: permission denied"
        );
    }

    #[test]
    fn test_every_error_is_retryable() {
        assert!(OperatorError::Timeout("pass".to_string()).is_retryable());
        assert!(OperatorError::ValidationError("topic".to_string()).is_retryable());
        assert!(OperatorError::TopicNotFound("t".to_string()).is_retryable());
    }

    #[test]
    fn test_conflict_detection() {
        assert!(OperatorError::Conflict("default/ps".to_string()).is_conflict());

        let api = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(OperatorError::KubeError(api).is_conflict());

        assert!(!OperatorError::Messaging("boom".to_string()).is_conflict());
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(OperatorError::DataPlane("x".to_string()).kind(), "dataplane");
        assert_eq!(
            OperatorError::ReferenceNotReady("x".to_string()).kind(),
            "reference"
        );
    }
}
