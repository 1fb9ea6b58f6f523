//! Waiting for a node pool to stop transitioning.
//!
//! Unlike [`crate::operation`], this polls the node pool itself rather than an
//! operation handle, so it also catches work started by someone else.

use std::fmt;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::api::{ApiError, ContainerApi};
use crate::error::NodePoolError;
use crate::retry::{retry_until, RetryConfig, RetryError, RetryFailure};

/// Classification of a node pool status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestingState {
    /// Settled and healthy.
    Ready,
    /// Settled in a broken state.
    Error,
    /// Still moving; keep polling.
    Transient,
}

/// Status strings that end a wait. Anything absent is [`RestingState::Transient`].
const NODE_POOL_RESTING_STATES: &[(&str, RestingState)] = &[
    ("RUNNING", RestingState::Ready),
    ("RUNNING_WITH_ERROR", RestingState::Error),
    ("ERROR", RestingState::Error),
];

impl RestingState {
    /// Classify a node pool status. Total: unknown strings are `Transient`.
    pub fn classify(status: &str) -> Self {
        NODE_POOL_RESTING_STATES
            .iter()
            .find(|(known, _)| *known == status)
            .map(|(_, state)| *state)
            .unwrap_or(RestingState::Transient)
    }
}

/// The status a node pool settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingStatus {
    /// Raw status string.
    pub status: String,
    /// Its classification, never `Transient`.
    pub state: RestingState,
}

impl RestingStatus {
    /// Whether the pool settled in an error state.
    pub fn is_error(&self) -> bool {
        self.state == RestingState::Error
    }
}

enum Pending {
    Status { status: String, message: String },
    Fetch(ApiError),
}

impl fmt::Display for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pending::Status { status, message } => {
                write!(f, "state {:?} with message {:?}", status, message)
            }
            Pending::Fetch(err) => write!(f, "{}", err),
        }
    }
}

/// Poll the node pool `name` until its status is a resting state.
///
/// An error resting state is returned as a value; the caller decides whether
/// it is a failure. Not-found comes back as [`NodePoolError::NotFound`] so that
/// deletes can treat it as success. Transient fetch failures are polled
/// through until `timeout`. `user_project` is passed on to every fetch.
#[instrument(skip(api), fields(node_pool = %name))]
pub async fn await_resting_state(
    api: &dyn ContainerApi,
    name: &str,
    user_project: Option<&str>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<RestingStatus, NodePoolError> {
    let config = RetryConfig::fixed(poll_interval);
    let activity = "await node pool resting state";

    let result = retry_until(&config, timeout, activity, move || async move {
        let pool = match api.get_node_pool(name, user_project).await {
            Ok(pool) => pool,
            Err(e) if e.is_transient() => return Err(RetryError::Retryable(Pending::Fetch(e))),
            Err(e) => return Err(RetryError::Permanent(e)),
        };

        let state = RestingState::classify(&pool.status);
        match state {
            RestingState::Ready => {
                debug!(
                    status = %pool.status,
                    message = %pool.status_message,
                    "NodePool is ready"
                );
            }
            RestingState::Error => {
                debug!(
                    status = %pool.status,
                    message = %pool.status_message,
                    "NodePool has an error state"
                );
            }
            RestingState::Transient => {
                return Err(RetryError::Retryable(Pending::Status {
                    status: pool.status,
                    message: pool.status_message,
                }));
            }
        }
        Ok(RestingStatus {
            status: pool.status,
            state,
        })
    })
    .await;

    match result {
        Ok(status) => Ok(status),
        Err(RetryFailure::Permanent(e)) if e.is_not_found() => {
            Err(NodePoolError::NotFound(name.to_string()))
        }
        Err(RetryFailure::Permanent(e)) => Err(NodePoolError::Api(e)),
        Err(RetryFailure::TimedOut {
            last_error,
            timeout,
        }) => Err(NodePoolError::Timeout {
            activity: match last_error {
                Some(last) => format!(
                    "waiting for NodePool {} to reach a resting state, last seen {}",
                    name, last
                ),
                None => format!("waiting for NodePool {} to reach a resting state", name),
            },
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockContainerApi;
    use crate::types::NodePool;

    const NAME: &str = "projects/p/locations/l/clusters/c/nodePools/np";

    fn pool(status: &str) -> NodePool {
        NodePool {
            name: "np".to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(RestingState::classify("RUNNING"), RestingState::Ready);
        assert_eq!(RestingState::classify("ERROR"), RestingState::Error);
        assert_eq!(
            RestingState::classify("RUNNING_WITH_ERROR"),
            RestingState::Error
        );
        assert_eq!(
            RestingState::classify("PROVISIONING"),
            RestingState::Transient
        );
        assert_eq!(
            RestingState::classify("RECONCILING"),
            RestingState::Transient
        );
        assert_eq!(RestingState::classify("STOPPING"), RestingState::Transient);
        assert_eq!(RestingState::classify(""), RestingState::Transient);
        assert_eq!(RestingState::classify("running"), RestingState::Transient);
    }

    #[tokio::test]
    async fn test_waits_through_transient_states() {
        let api = MockContainerApi::new();
        api.insert_node_pool(NAME, pool("PROVISIONING"));
        api.script_statuses(NAME, &["PROVISIONING", "RECONCILING", "RUNNING"]);

        let status = await_resting_state(
            &api,
            NAME,
            None,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(status.status, "RUNNING");
        assert_eq!(status.state, RestingState::Ready);
        assert_eq!(api.count_calls("get_node_pool"), 3);
    }

    #[tokio::test]
    async fn test_error_state_is_a_value() {
        let api = MockContainerApi::new();
        api.insert_node_pool(NAME, pool("RUNNING_WITH_ERROR"));

        let status = await_resting_state(
            &api,
            NAME,
            None,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert!(status.is_error());
        assert_eq!(status.status, "RUNNING_WITH_ERROR");
    }

    #[tokio::test]
    async fn test_not_found_is_an_error() {
        let api = MockContainerApi::new();

        let err = await_resting_state(
            &api,
            NAME,
            None,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NodePoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let api = MockContainerApi::new();
        api.insert_node_pool(NAME, pool("RUNNING"));
        api.fail_next("get_node_pool", ApiError::Unavailable("blip".to_string()));

        let status = await_resting_state(
            &api,
            NAME,
            None,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(status.state, RestingState::Ready);
        assert_eq!(api.count_calls("get_node_pool"), 2);
    }

    #[tokio::test]
    async fn test_hard_fetch_errors_propagate() {
        let api = MockContainerApi::new();
        api.insert_node_pool(NAME, pool("RUNNING"));
        api.fail_next(
            "get_node_pool",
            ApiError::PermissionDenied("nope".to_string()),
        );

        let err = await_resting_state(
            &api,
            NAME,
            None,
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, NodePoolError::Api(ApiError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_times_out_on_stuck_pool() {
        let api = MockContainerApi::new();
        api.insert_node_pool(NAME, pool("PROVISIONING"));

        let err = await_resting_state(
            &api,
            NAME,
            None,
            Duration::from_millis(20),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("PROVISIONING"));
    }
}
