//! Error types for node pool lifecycle operations.

use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;
use crate::node_pool::ReplacementStep;

/// Errors returned by the node pool lifecycle.
///
/// Transient remote rejections never appear here directly: they are retried
/// until the operation deadline and only surface as [`NodePoolError::Timeout`].
#[derive(Debug, Error)]
pub enum NodePoolError {
    /// The node pool does not exist. Whether that is a failure depends on the caller.
    #[error("Node pool not found: {0}")]
    NotFound(String),

    /// A remote call was rejected with a non-retryable error.
    #[error("Container API error: {0}")]
    Api(#[from] ApiError),

    /// The remote operation finished unsuccessfully.
    #[error("Operation {operation} failed while {activity}: {message}")]
    OperationFailed {
        /// What the operation was doing, e.g. "creating GKE NodePool".
        activity: String,
        /// The operation name.
        operation: String,
        /// Failure detail reported by the service.
        message: String,
    },

    /// The call succeeded but the node pool settled into an error status.
    #[error("NodePool {name} reached the error state {status:?}")]
    RestingState {
        /// Node pool name.
        name: String,
        /// The status string reported by the service.
        status: String,
    },

    /// Polling gave up. The remote work was not cancelled and may still finish.
    #[error("Timeout after {timeout:?} while {activity}")]
    Timeout {
        /// What was being waited on.
        activity: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A blue/green replacement stopped part way through.
    #[error("Node pool replacement interrupted at {step} (completed: {completed:?}): {source}")]
    ReplacementInterrupted {
        /// The step that failed.
        step: ReplacementStep,
        /// Steps that finished before the failure.
        completed: Vec<ReplacementStep>,
        /// The failure of `step`.
        #[source]
        source: Box<NodePoolError>,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A resource id could not be parsed.
    #[error("Invalid node pool id: {0}")]
    InvalidId(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// The provider was used before `configure`.
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NodePoolError {
    /// Get the error message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::NotFound(msg)
            | Self::Configuration(msg)
            | Self::InvalidId(msg)
            | Self::UnknownResource(msg)
            | Self::NotConfigured(msg) => msg.clone(),
            Self::Api(err) => err.to_string(),
            Self::OperationFailed { message, .. } => message.clone(),
            Self::RestingState { status, .. } => status.clone(),
            Self::Timeout { activity, .. } => activity.clone(),
            Self::ReplacementInterrupted { source, .. } => source.message(),
            Self::Serialization(err) => err.to_string(),
        }
    }

    /// Whether the node pool was absent, either directly or as reported by the API.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error is a polling timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<NodePoolError> for tonic::Status {
    fn from(err: NodePoolError) -> Self {
        let msg = err.to_string();
        match err {
            NodePoolError::NotFound(_) => tonic::Status::not_found(msg),
            NodePoolError::Api(api) => match api {
                ApiError::NotFound(_) => tonic::Status::not_found(msg),
                ApiError::FailedPrecondition(_) => tonic::Status::failed_precondition(msg),
                ApiError::Unavailable(_) => tonic::Status::unavailable(msg),
                ApiError::ResourceExhausted(_) => tonic::Status::resource_exhausted(msg),
                ApiError::PermissionDenied(_) => tonic::Status::permission_denied(msg),
                ApiError::InvalidArgument(_) => tonic::Status::invalid_argument(msg),
                ApiError::Other { .. } => tonic::Status::unknown(msg),
            },
            NodePoolError::OperationFailed { .. } => tonic::Status::aborted(msg),
            NodePoolError::RestingState { .. } => tonic::Status::failed_precondition(msg),
            NodePoolError::Timeout { .. } => tonic::Status::deadline_exceeded(msg),
            NodePoolError::ReplacementInterrupted { .. } => tonic::Status::aborted(msg),
            NodePoolError::Configuration(_) => tonic::Status::failed_precondition(msg),
            NodePoolError::InvalidId(_) => tonic::Status::invalid_argument(msg),
            NodePoolError::UnknownResource(_) => tonic::Status::not_found(msg),
            NodePoolError::NotConfigured(_) => tonic::Status::failed_precondition(msg),
            NodePoolError::Serialization(_) => tonic::Status::invalid_argument(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodePoolError::NotFound("pool-a".to_string());
        assert_eq!(format!("{}", err), "Node pool not found: pool-a");

        let err = NodePoolError::RestingState {
            name: "pool-a".to_string(),
            status: "ERROR".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "NodePool pool-a reached the error state \"ERROR\""
        );

        let err = NodePoolError::Timeout {
            activity: "creating GKE NodePool".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            format!("{}", err),
            "Timeout after 5s while creating GKE NodePool"
        );
    }

    #[test]
    fn test_replacement_display_names_step() {
        let err = NodePoolError::ReplacementInterrupted {
            step: ReplacementStep::CreateOriginal,
            completed: vec![ReplacementStep::CreateTemp, ReplacementStep::DeleteOriginal],
            source: Box::new(NodePoolError::Configuration("boom".to_string())),
        };
        let display = err.to_string();
        assert!(display.contains("create original node pool"));
        assert!(display.contains("boom"));
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_is_not_found() {
        assert!(NodePoolError::NotFound("x".to_string()).is_not_found());
        assert!(NodePoolError::Api(ApiError::NotFound("x".to_string())).is_not_found());
        assert!(!NodePoolError::Api(ApiError::FailedPrecondition("x".to_string())).is_not_found());
        assert!(!NodePoolError::Configuration("x".to_string()).is_not_found());
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = NodePoolError::NotFound("x".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = NodePoolError::Timeout {
            activity: "x".to_string(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = NodePoolError::RestingState {
            name: "x".to_string(),
            status: "ERROR".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status =
            NodePoolError::Api(ApiError::PermissionDenied("x".to_string())).into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status: tonic::Status = NodePoolError::OperationFailed {
            activity: "a".to_string(),
            operation: "op".to_string(),
            message: "m".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Aborted);
    }
}
