//! Polling long-running container operations to completion.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::api::{ApiError, ContainerApi, Operation, OperationStatus};
use crate::error::NodePoolError;
use crate::retry::{retry_until, RetryConfig, RetryError, RetryFailure};

/// Default interval between operation and status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Why another poll is needed.
enum Progress {
    Running(OperationStatus),
    Fetch(ApiError),
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Running(status) => write!(f, "operation status {:?}", status),
            Progress::Fetch(err) => write!(f, "{}", err),
        }
    }
}

/// Poll `operation` until it is done, then report how it ended.
///
/// A timeout means only that this caller stopped waiting; the service keeps
/// working and a later read is the only way to learn the outcome.
#[instrument(skip(api, operation), fields(operation = %operation.name))]
pub async fn await_operation(
    api: &dyn ContainerApi,
    operation: &Operation,
    project: &str,
    location: &str,
    activity: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Operation, NodePoolError> {
    let finished = if operation.is_terminal() {
        operation.clone()
    } else {
        let config = RetryConfig::fixed(poll_interval);
        let name = operation.name.as_str();
        let result = retry_until(&config, timeout, activity, move || async move {
            match api.get_operation(project, location, name).await {
                Ok(op) if op.is_terminal() => Ok(op),
                Ok(op) => {
                    debug!(
                        status = ?op.status,
                        message = %op.status_message,
                        "Operation in progress"
                    );
                    Err(RetryError::Retryable(Progress::Running(op.status)))
                }
                Err(e) if e.is_transient() => Err(RetryError::Retryable(Progress::Fetch(e))),
                Err(e) => Err(RetryError::Permanent(e)),
            }
        })
        .await;

        match result {
            Ok(op) => op,
            Err(RetryFailure::Permanent(e)) => return Err(NodePoolError::Api(e)),
            Err(RetryFailure::TimedOut { timeout, .. }) => {
                return Err(NodePoolError::Timeout {
                    activity: activity.to_string(),
                    timeout,
                })
            }
        }
    };

    if let Some(message) = finished.failure() {
        return Err(NodePoolError::OperationFailed {
            activity: activity.to_string(),
            operation: finished.name.clone(),
            message,
        });
    }

    info!(activity = %activity, "Operation finished");
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockContainerApi;

    fn running(name: &str) -> Operation {
        Operation {
            name: name.to_string(),
            status: OperationStatus::Running,
            ..Default::default()
        }
    }

    async fn wait(
        api: &MockContainerApi,
        op: &Operation,
        timeout: Duration,
    ) -> Result<Operation, NodePoolError> {
        await_operation(
            api,
            op,
            "p",
            "us-east1",
            "creating GKE NodePool",
            timeout,
            Duration::from_millis(1),
        )
        .await
    }

    #[tokio::test]
    async fn test_polls_until_done() {
        let api = MockContainerApi::new();
        api.script_operation(
            "op-1",
            &[OperationStatus::Pending, OperationStatus::Running, OperationStatus::Done],
            None,
        );

        let op = wait(&api, &running("op-1"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(op.status, OperationStatus::Done);
        assert_eq!(api.count_calls("get_operation"), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_returned_immediately() {
        let api = MockContainerApi::new();
        api.script_operation(
            "op-1",
            &[OperationStatus::Done],
            Some("Insufficient regional quota"),
        );

        let err = wait(&api, &running("op-1"), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            NodePoolError::OperationFailed {
                activity,
                operation,
                message,
            } => {
                assert_eq!(activity, "creating GKE NodePool");
                assert_eq!(operation, "op-1");
                assert_eq!(message, "Insufficient regional quota");
            }
            other => panic!("expected operation failure, got {:?}", other),
        }
        assert_eq!(api.count_calls("get_operation"), 1);
    }

    #[tokio::test]
    async fn test_already_terminal_is_not_fetched() {
        let api = MockContainerApi::new();
        let done = Operation {
            name: "op-1".to_string(),
            status: OperationStatus::Done,
            ..Default::default()
        };

        let op = wait(&api, &done, Duration::from_secs(5)).await.unwrap();
        assert_eq!(op.name, "op-1");
        assert_eq!(api.count_calls("get_operation"), 0);
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_keep_polling() {
        let api = MockContainerApi::new();
        api.script_operation("op-1", &[OperationStatus::Done], None);
        api.fail_next("get_operation", ApiError::ResourceExhausted("rate".to_string()));
        api.fail_next("get_operation", ApiError::Unavailable("reset".to_string()));

        let op = wait(&api, &running("op-1"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(op.status, OperationStatus::Done);
        assert_eq!(api.count_calls("get_operation"), 3);
    }

    #[tokio::test]
    async fn test_hard_fetch_error_propagates() {
        let api = MockContainerApi::new();
        api.script_operation("op-1", &[OperationStatus::Done], None);
        api.fail_next("get_operation", ApiError::PermissionDenied("no".to_string()));

        let err = wait(&api, &running("op-1"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, NodePoolError::Api(ApiError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_timeout_does_not_imply_failure() {
        let api = MockContainerApi::new();
        api.script_operation("op-1", &[OperationStatus::Running], None);

        let err = wait(&api, &running("op-1"), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Timeout after 20ms while creating GKE NodePool"
        );
    }
}
