//! The host-facing provider surface.
//!
//! A host drives resources through [`ProviderService`] using plain JSON state,
//! keyed by resource type. [`NodePoolProvider`] serves
//! `google_container_node_pool` on top of [`NodePoolController`].

use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::ContainerApi;
use crate::config::{ProviderConfig, Timeouts};
use crate::error::NodePoolError;
use crate::mutex::MutexKv;
use crate::node_pool::{migrate_state, NodePoolController};
use crate::resource_data::StateData;

/// Resource type served by [`NodePoolProvider`].
pub const NODE_POOL_RESOURCE: &str = "google_container_node_pool";

/// A failed create or update, with the state the host should keep.
///
/// `state` is `None` when nothing was left behind, and carries the identity
/// when the resource may exist anyway (e.g. after a timeout).
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ApplyError {
    /// State to persist despite the failure.
    pub state: Option<Value>,
    /// What went wrong.
    pub error: NodePoolError,
}

impl From<NodePoolError> for ApplyError {
    fn from(error: NodePoolError) -> Self {
        Self { state: None, error }
    }
}

impl From<ApplyError> for tonic::Status {
    fn from(err: ApplyError) -> Self {
        err.error.into()
    }
}

/// Operations a host invokes on a provider.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Resource types this provider manages.
    fn resource_types(&self) -> Vec<String>;

    /// Configure the provider with credentials and settings.
    async fn configure(&self, config: Value) -> Result<(), NodePoolError>;

    /// Stop the provider gracefully.
    async fn stop(&self) -> Result<(), NodePoolError> {
        Ok(())
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Upgrade resource state from an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, NodePoolError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Create a new resource.
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ApplyError>;

    /// Read the current state of a resource; `None` when it no longer exists.
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, NodePoolError>;

    /// Update an existing resource.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ApplyError>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), NodePoolError>;

    /// Whether the resource still exists.
    async fn exists(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<bool, NodePoolError>;

    /// Import existing infrastructure into management.
    async fn import_resource(
        &self,
        resource_type: &str,
        _id: &str,
    ) -> Result<Value, NodePoolError> {
        Err(NodePoolError::UnknownResource(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }
}

/// Serves node pools over a container API.
pub struct NodePoolProvider {
    api: Arc<dyn ContainerApi>,
    locks: Arc<MutexKv>,
    controller: RwLock<Option<Arc<NodePoolController>>>,
}

impl NodePoolProvider {
    /// Create an unconfigured provider.
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self {
            api,
            locks: Arc::new(MutexKv::new()),
            controller: RwLock::new(None),
        }
    }

    /// Share a lock registry with other providers in this process.
    pub fn with_locks(mut self, locks: Arc<MutexKv>) -> Self {
        self.locks = locks;
        self
    }

    fn controller(&self, resource_type: &str) -> Result<Arc<NodePoolController>, NodePoolError> {
        if resource_type != NODE_POOL_RESOURCE {
            return Err(NodePoolError::UnknownResource(resource_type.to_string()));
        }
        self.controller
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                NodePoolError::NotConfigured(format!("{} used before configure", resource_type))
            })
    }
}

/// Per-resource `timeouts` (in seconds) over the provider defaults.
fn resource_timeouts(defaults: Timeouts, state: &Value) -> Timeouts {
    let Some(timeouts) = state.get("timeouts").filter(|t| t.is_object()) else {
        return defaults;
    };
    let pick = |key: &str, default: u64| {
        timeouts
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    };
    Timeouts {
        create_secs: pick("create_secs", defaults.create_secs),
        update_secs: pick("update_secs", defaults.update_secs),
        delete_secs: pick("delete_secs", defaults.delete_secs),
    }
}

fn state_data(controller: &NodePoolController, state: Value) -> StateData {
    let timeouts = resource_timeouts(controller.config().timeouts, &state);
    StateData::new(state).with_timeouts(timeouts)
}

#[async_trait::async_trait]
impl ProviderService for NodePoolProvider {
    fn resource_types(&self) -> Vec<String> {
        vec![NODE_POOL_RESOURCE.to_string()]
    }

    async fn configure(&self, config: Value) -> Result<(), NodePoolError> {
        let config = ProviderConfig::from_value(config)?.with_env_defaults();
        info!(
            project = ?config.project,
            region = ?config.region,
            zone = ?config.zone,
            "Provider configured"
        );
        let controller =
            NodePoolController::new(self.api.clone(), self.locks.clone(), Arc::new(config));
        *self.controller.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(controller));
        Ok(())
    }

    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, NodePoolError> {
        if resource_type != NODE_POOL_RESOURCE {
            return Err(NodePoolError::UnknownResource(resource_type.to_string()));
        }
        migrate_state(version, state)
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ApplyError> {
        let controller = self.controller(resource_type)?;
        let mut d = state_data(&controller, planned_state);
        match controller.create(&mut d).await {
            Ok(()) => d.into_state().ok_or_else(|| {
                ApplyError::from(NodePoolError::NotFound(
                    "node pool vanished after create".to_string(),
                ))
            }),
            Err(error) => Err(ApplyError {
                state: d.into_state(),
                error,
            }),
        }
    }

    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, NodePoolError> {
        let controller = self.controller(resource_type)?;
        let mut d = state_data(&controller, current_state);
        match controller.read(&mut d).await {
            Ok(()) => Ok(d.into_state()),
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "Removing node pool from state because it no longer exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ApplyError> {
        let controller = self.controller(resource_type)?;
        let mut d = state_data(&controller, planned_state).with_prior(prior_state);
        match controller.update(&mut d).await {
            Ok(()) => d.into_state().ok_or_else(|| {
                ApplyError::from(NodePoolError::NotFound(
                    "node pool vanished after update".to_string(),
                ))
            }),
            Err(error) => Err(ApplyError {
                state: d.into_state(),
                error,
            }),
        }
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), NodePoolError> {
        let controller = self.controller(resource_type)?;
        let mut d = state_data(&controller, current_state);
        controller.delete(&mut d).await
    }

    async fn exists(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<bool, NodePoolError> {
        let controller = self.controller(resource_type)?;
        let d = state_data(&controller, current_state);
        controller.exists(&d).await
    }

    async fn import_resource(&self, resource_type: &str, id: &str) -> Result<Value, NodePoolError> {
        let controller = self.controller(resource_type)?;
        controller
            .import(id)
            .await?
            .into_state()
            .ok_or_else(|| NodePoolError::NotFound(id.to_string()))
    }
}
