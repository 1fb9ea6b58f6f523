//! The container API collaborator.
//!
//! [`ContainerApi`] is the seam between the lifecycle logic and the GKE and
//! Compute services. Every remote error is classified exactly once, when it is
//! turned into an [`ApiError`], and the rest of the crate only looks at the
//! classification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NodeManagement, NodePool, NodePoolAutoscaling, UpgradeSettings};

/// Errors returned by the container API, classified at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The addressed entity does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The cluster is busy with another operation; retry later.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The service could not be reached or is temporarily down.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Quota or rate limit exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Authentication or authorization failure.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other failure.
    #[error("googleapi: Error {code}: {message}")]
    Other {
        /// HTTP status code.
        code: u16,
        /// Error message from the service.
        message: String,
    },
}

impl ApiError {
    /// Classify an HTTP error response.
    ///
    /// GKE reports a busy cluster as 400 with `FAILED_PRECONDITION` in the
    /// body, so the message is inspected for that marker as well.
    pub fn from_http(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound(message),
            412 => Self::FailedPrecondition(message),
            400 | 409 if message.contains("FAILED_PRECONDITION") => {
                Self::FailedPrecondition(message)
            }
            400 => Self::InvalidArgument(message),
            401 | 403 => Self::PermissionDenied(message),
            429 => Self::ResourceExhausted(message),
            502..=504 => Self::Unavailable(message),
            code => Self::Other { code, message },
        }
    }

    /// Whether the entity was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the target cluster was busy.
    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition(_))
    }

    /// Whether the failure is a network or rate-limit blip worth polling through.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ResourceExhausted(_))
    }
}

impl From<tonic::Status> for ApiError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(message),
            tonic::Code::FailedPrecondition => Self::FailedPrecondition(message),
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => Self::Unavailable(message),
            tonic::Code::ResourceExhausted => Self::ResourceExhausted(message),
            tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
                Self::PermissionDenied(message)
            }
            tonic::Code::InvalidArgument => Self::InvalidArgument(message),
            tonic::Code::AlreadyExists | tonic::Code::Aborted => Self::Other { code: 409, message },
            _ => Self::Other { code: 500, message },
        }
    }
}

/// Lifecycle status of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Accepted but not started.
    #[default]
    Pending,
    /// In progress.
    Running,
    /// Finished, successfully or not.
    Done,
    /// Being aborted by the service.
    Aborting,
}

/// Handle to a long-running remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Operation {
    /// Opaque operation identifier.
    pub name: String,
    /// Kind of work, e.g. `CREATE_NODE_POOL`.
    pub operation_type: String,
    /// Current status.
    pub status: OperationStatus,
    /// Human-readable progress or failure detail.
    pub status_message: String,
    /// Failure detail, set when the operation finished unsuccessfully.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Link to the entity the operation acts on.
    pub target_link: String,
}

impl Operation {
    /// Whether the operation will not change status anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OperationStatus::Done | OperationStatus::Aborting)
    }

    /// The failure detail of a terminal operation, if it failed.
    pub fn failure(&self) -> Option<String> {
        match self.status {
            OperationStatus::Done => self.error.clone(),
            OperationStatus::Aborting => Some(
                self.error
                    .clone()
                    .unwrap_or_else(|| format!("operation aborted: {}", self.status_message)),
            ),
            OperationStatus::Pending | OperationStatus::Running => None,
        }
    }
}

/// Address of a zonal instance group manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceGroupRef {
    /// Project ID.
    pub project: String,
    /// Zone.
    pub zone: String,
    /// Instance group manager name.
    pub name: String,
}

impl InstanceGroupRef {
    /// Parse an instance group URL as returned in `instanceGroupUrls`.
    ///
    /// Those URLs actually point at instance group managers:
    /// `.../projects/{project}/zones/{zone}/instanceGroupManagers/{name}`.
    pub fn parse(url: &str) -> Result<Self, ApiError> {
        let parts: Vec<&str> = url.split('/').collect();
        let found = parts.windows(6).find_map(|w| match w {
            ["projects", project, "zones", zone, "instanceGroupManagers", name]
                if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
            {
                Some(Self {
                    project: project.to_string(),
                    zone: zone.to_string(),
                    name: name.to_string(),
                })
            }
            _ => None,
        });
        found.ok_or_else(|| {
            ApiError::InvalidArgument(format!(
                "error reading instance group manager URL {:?}",
                url
            ))
        })
    }
}

/// The slice of an instance group manager the lifecycle needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceGroupManager {
    /// Number of instances the manager is driving towards.
    pub target_size: i64,
}

/// A targeted node pool patch.
///
/// Only the fields named in `update_mask` are applied by the service; the
/// other values are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolUpdate {
    /// camelCase names of the fields to change.
    pub update_mask: Vec<String>,
    /// Desired node count per zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<i64>,
    /// Desired autoscaling; a disabled value turns it off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<NodePoolAutoscaling>,
    /// Desired management switches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management: Option<NodeManagement>,
    /// Desired node version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Desired zones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<String>>,
    /// Desired surge settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_settings: Option<UpgradeSettings>,
}

impl NodePoolUpdate {
    /// Whether the patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.update_mask.is_empty()
    }
}

/// Calls against the GKE node pool and Compute instance group APIs.
///
/// Implementations classify failures into [`ApiError`] variants; the lifecycle
/// decides what to retry based on that classification alone.
///
/// Node pool calls take a `user_project`: when set, the request is billed to
/// that project, which HTTP clients send as the `X-Goog-User-Project` header.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Create `node_pool` under the cluster at `parent`.
    async fn create_node_pool(
        &self,
        parent: &str,
        node_pool: &NodePool,
        user_project: Option<&str>,
    ) -> Result<Operation, ApiError>;

    /// Fetch the node pool with the fully-qualified `name`.
    async fn get_node_pool(
        &self,
        name: &str,
        user_project: Option<&str>,
    ) -> Result<NodePool, ApiError>;

    /// Apply a targeted patch to the node pool with the fully-qualified `name`.
    async fn update_node_pool(
        &self,
        name: &str,
        update: &NodePoolUpdate,
        user_project: Option<&str>,
    ) -> Result<Operation, ApiError>;

    /// Delete the node pool with the fully-qualified `name`.
    async fn delete_node_pool(
        &self,
        name: &str,
        user_project: Option<&str>,
    ) -> Result<Operation, ApiError>;

    /// Fetch the current state of an operation.
    async fn get_operation(
        &self,
        project: &str,
        location: &str,
        operation: &str,
    ) -> Result<Operation, ApiError>;

    /// Fetch an instance group manager backing a node pool.
    async fn get_instance_group_manager(
        &self,
        group: &InstanceGroupRef,
    ) -> Result<InstanceGroupManager, ApiError>;
}
