//! Data model for node pools and the cluster scope they live in.
//!
//! These types mirror the GKE REST representation (camelCase on the wire) and
//! the identity helpers used to address a node pool.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::NodePoolError;

/// Kind prefix of the cluster lock key.
pub const CLUSTER_LOCK_KIND: &str = "google-container-cluster";

/// Identifies the cluster that owns a node pool.
///
/// Built once per lifecycle call from configuration; every derived value is a
/// pure function of the three segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePoolInformation {
    project: String,
    location: String,
    cluster: String,
}

impl NodePoolInformation {
    /// Create the scope, rejecting empty segments and segments containing `/`.
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Result<Self, NodePoolError> {
        let info = Self {
            project: project.into(),
            location: location.into(),
            cluster: cluster.into(),
        };
        for (field, value) in [
            ("project", &info.project),
            ("location", &info.location),
            ("cluster", &info.cluster),
        ] {
            if value.is_empty() {
                return Err(NodePoolError::Configuration(format!(
                    "{} must not be empty",
                    field
                )));
            }
            if value.contains('/') {
                return Err(NodePoolError::Configuration(format!(
                    "{} {:?} must not contain '/'",
                    field, value
                )));
            }
        }
        Ok(info)
    }

    /// The project ID.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The cluster location (region or zone).
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The cluster name.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// `projects/{project}/locations/{location}/clusters/{cluster}`
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}/clusters/{}",
            self.project, self.location, self.cluster
        )
    }

    /// `{parent}/nodePools/{name}`, which is also the resource identity.
    pub fn fully_qualified_name(&self, name: &str) -> String {
        format!("{}/nodePools/{}", self.parent(), name)
    }

    /// Key of the lock serializing node pool mutations in this cluster.
    pub fn lock_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            CLUSTER_LOCK_KIND, self.project, self.location, self.cluster
        )
    }
}

/// Last path segment of a node pool id.
///
/// The name can come from `name`, `name_prefix` or neither, so it is always
/// read back from the id.
pub fn node_pool_name_from_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Parse `projects/{p}/locations/{l}/clusters/{c}/nodePools/{n}`.
pub fn parse_node_pool_id(id: &str) -> Result<(NodePoolInformation, String), NodePoolError> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "locations", location, "clusters", cluster, "nodePools", name]
            if !name.is_empty() =>
        {
            let info = NodePoolInformation::new(*project, *location, *cluster)
                .map_err(|e| NodePoolError::InvalidId(format!("{}: {}", id, e.message())))?;
            Ok((info, name.to_string()))
        }
        _ => Err(NodePoolError::InvalidId(format!(
            "{:?} does not match projects/{{project}}/locations/{{location}}/clusters/{{cluster}}/nodePools/{{name}}",
            id
        ))),
    }
}

/// Autoscaling bounds of a node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePoolAutoscaling {
    /// Whether the cluster autoscaler manages this pool.
    pub enabled: bool,
    /// Lower bound on the node count.
    pub min_node_count: i64,
    /// Upper bound on the node count.
    pub max_node_count: i64,
}

/// Pod density limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MaxPodsConstraint {
    /// Maximum number of pods scheduled on a single node.
    pub max_pods_per_node: i64,
}

/// Automatic repair and upgrade switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeManagement {
    /// Whether unhealthy nodes are repaired automatically.
    pub auto_repair: bool,
    /// Whether nodes follow the cluster version automatically.
    pub auto_upgrade: bool,
}

/// Surge upgrade parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeSettings {
    /// Extra nodes that may be added during an upgrade.
    pub max_surge: i64,
    /// Nodes that may be unavailable during an upgrade.
    pub max_unavailable: i64,
}

/// Remote node pool as returned by the container API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePool {
    /// Node pool name, unique within the cluster.
    pub name: String,
    /// Node count per zone at creation time.
    pub initial_node_count: i64,
    /// Machine configuration, passed through untouched.
    pub config: serde_json::Value,
    /// Zones the nodes are placed in.
    pub locations: BTreeSet<String>,
    /// Kubernetes version of the nodes.
    pub version: String,
    /// Autoscaling bounds, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<NodePoolAutoscaling>,
    /// Pod density limit, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pods_constraint: Option<MaxPodsConstraint>,
    /// Repair and upgrade switches.
    pub management: NodeManagement,
    /// Surge upgrade parameters, if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_settings: Option<UpgradeSettings>,
    /// URLs of the backing instance group managers, in API order.
    pub instance_group_urls: Vec<String>,
    /// Raw status string, see [`crate::resting::RestingState`].
    pub status: String,
    /// Human-readable detail accompanying `status`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_message: String,
}

/// A change to a single attribute between prior and planned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The path to the attribute that changed.
    pub path: String,
    /// The value before the change (None if it was unset).
    pub before: Option<serde_json::Value>,
    /// The value after the change (None if it is being unset).
    pub after: Option<serde_json::Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(
        path: impl Into<String>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }
}
