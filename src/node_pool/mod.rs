//! The node pool lifecycle controller.
//!
//! [`NodePoolController`] drives create, read, update, delete and exists
//! against a [`ContainerApi`]. Mutating calls against a cluster are started
//! under that cluster's lock and retried while the service reports a failed
//! precondition; the lock is released as soon as a call is accepted, and the
//! resulting operation is awaited outside it.

mod expand;
mod migrate;
mod replace;

pub use expand::{expand_node_pool, flatten_node_pool, prefixed_unique_id, UNIQUE_ID_PREFIX};
pub use migrate::{migrate_state, SCHEMA_VERSION};
pub use replace::{ReplacementPlan, ReplacementStep, TEMP_NODE_POOL_NAME};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiError, ContainerApi, InstanceGroupRef, Operation};
use crate::config::{ProviderConfig, TimeoutKind};
use crate::error::NodePoolError;
use crate::mutex::MutexKv;
use crate::operation::await_operation;
use crate::resource_data::{ResourceData, StateData};
use crate::resting::{await_resting_state, RestingStatus};
use crate::retry::{retry_until, RetryError, RetryFailure};
use crate::types::{node_pool_name_from_id, parse_node_pool_id, NodePool, NodePoolInformation};

use expand::{changed_fields, expand_replacement, expand_update, requires_replacement};

const CREATING: &str = "creating GKE NodePool";
const UPDATING: &str = "updating GKE NodePool";
const DELETING: &str = "deleting GKE NodePool";

fn remaining(start: Instant, timeout: Duration) -> Duration {
    timeout.saturating_sub(start.elapsed())
}

/// Whether the service turned a create down, as opposed to the outcome being unknown.
fn is_rejection(err: &NodePoolError) -> bool {
    matches!(err, NodePoolError::Api(e) if !e.is_transient())
}

/// Runs node pool lifecycle calls.
///
/// Controllers that should serialize against each other must share the same
/// [`MutexKv`].
pub struct NodePoolController {
    api: Arc<dyn ContainerApi>,
    locks: Arc<MutexKv>,
    config: Arc<ProviderConfig>,
}

impl NodePoolController {
    /// Create a controller over `api`.
    pub fn new(
        api: Arc<dyn ContainerApi>,
        locks: Arc<MutexKv>,
        config: Arc<ProviderConfig>,
    ) -> Self {
        Self { api, locks, config }
    }

    /// The provider configuration in use.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The cluster a resource belongs to, with provider defaults applied.
    pub fn node_pool_info(
        &self,
        d: &dyn ResourceData,
    ) -> Result<NodePoolInformation, NodePoolError> {
        let project = self.config.project_for(d)?;
        let location = self.config.location_for(d)?;
        let cluster = d.get_str("cluster").ok_or_else(|| {
            NodePoolError::Configuration("cluster: required field is not set".to_string())
        })?;
        NodePoolInformation::new(project, location, cluster)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the node pool described by `d`.
    ///
    /// The identity is set before the remote call. It is cleared again if the
    /// service rejects the call or the operation fails. It is kept when the
    /// outcome is unknown (a timeout or a transient call failure), since the
    /// pool may still come up.
    #[instrument(skip(self, d))]
    pub async fn create(&self, d: &mut dyn ResourceData) -> Result<(), NodePoolError> {
        let info = self.node_pool_info(&*d)?;
        let pool = expand_node_pool(&*d)?;
        let timeout = d.timeout(TimeoutKind::Create);
        let name = info.fully_qualified_name(&pool.name);

        info!(node_pool = %pool.name, cluster = %info.cluster(), "GKE NodePool is being created");
        d.set_id(name.clone());

        let start = Instant::now();
        let parent = info.parent();
        let user_project = self.user_project(&info);
        let op = match self
            .submit(&info, CREATING, timeout, || {
                self.api.create_node_pool(&parent, &pool, user_project)
            })
            .await
        {
            Ok(op) => op,
            Err(e) => {
                if is_rejection(&e) {
                    d.set_id(String::new());
                }
                return Err(e);
            }
        };

        if let Err(e) = self.wait_for(&info, &op, CREATING, remaining(start, timeout)).await {
            if !e.is_timeout() {
                d.set_id(String::new());
            }
            return Err(e);
        }
        info!(node_pool = %pool.name, "GKE NodePool created");

        self.read(d).await?;

        let status = self.wait_for_resting(&info, &name, timeout).await?;
        if status.is_error() {
            return Err(NodePoolError::RestingState {
                name: pool.name,
                status: status.status,
            });
        }
        Ok(())
    }

    /// Refresh `d` from the service.
    ///
    /// A missing pool is reported as [`NodePoolError::NotFound`]; the caller
    /// decides whether to drop the resource.
    #[instrument(skip(self, d), fields(id = %d.id()))]
    pub async fn read(&self, d: &mut dyn ResourceData) -> Result<(), NodePoolError> {
        let info = self.node_pool_info(&*d)?;
        let name = node_pool_name_from_id(d.id()).to_string();
        if name.is_empty() {
            return Err(NodePoolError::NotFound(format!(
                "node pool in cluster {:?} has no id",
                info.cluster()
            )));
        }

        let pool = self
            .api
            .get_node_pool(&info.fully_qualified_name(&name), self.user_project(&info))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    NodePoolError::NotFound(format!(
                        "NodePool {:?} from cluster {:?}",
                        name,
                        info.cluster()
                    ))
                } else {
                    NodePoolError::Api(e)
                }
            })?;

        let (node_count, instance_group_urls) = self.current_node_count(&pool).await?;
        let state = flatten_node_pool(
            &pool,
            node_count,
            &instance_group_urls,
            d.get("name_prefix"),
        );
        for (key, value) in state {
            d.set(&key, value)?;
        }
        d.set("project", json!(info.project()))?;
        d.set("location", json!(info.location()))?;
        d.set("cluster", json!(info.cluster()))?;
        Ok(())
    }

    /// Converge the pool to the planned state in `d`.
    ///
    /// In-place changes go out as one masked patch. A change only a new pool
    /// can carry triggers a blue/green replacement under the same name.
    #[instrument(skip(self, d), fields(id = %d.id()))]
    pub async fn update(&self, d: &mut dyn ResourceData) -> Result<(), NodePoolError> {
        let info = self.node_pool_info(&*d)?;
        let name = node_pool_name_from_id(d.id()).to_string();
        let fq_name = info.fully_qualified_name(&name);
        let timeout = d.timeout(TimeoutKind::Update);

        info!(node_pool = %name, "GKE NodePool is being updated");
        self.wait_for_resting(&info, &fq_name, timeout).await?;

        let changes = changed_fields(&*d);
        if requires_replacement(&changes) {
            let plan = ReplacementPlan::new(name.clone(), expand_replacement(&*d, &name)?);
            let create_timeout = d.timeout(TimeoutKind::Create);
            let delete_timeout = d.timeout(TimeoutKind::Delete);
            self.replace(&info, plan, create_timeout, delete_timeout)
                .await?;
        } else {
            let update = expand_update(&*d, &changes)?;
            if update.is_empty() {
                debug!(node_pool = %name, "No in-place changes to apply");
            } else {
                info!(
                    node_pool = %name,
                    fields = ?update.update_mask,
                    "Updating GKE NodePool in place"
                );
                let start = Instant::now();
                let user_project = self.user_project(&info);
                let op = self
                    .submit(&info, UPDATING, timeout, || {
                        self.api.update_node_pool(&fq_name, &update, user_project)
                    })
                    .await?;
                self.wait_for(&info, &op, UPDATING, remaining(start, timeout))
                    .await?;
            }
        }

        d.set_id(fq_name.clone());
        self.wait_for_resting(&info, &fq_name, timeout).await?;
        info!(node_pool = %name, "GKE NodePool updated");
        self.read(d).await
    }

    /// Delete the pool. A pool that is already gone counts as deleted.
    #[instrument(skip(self, d), fields(id = %d.id()))]
    pub async fn delete(&self, d: &mut dyn ResourceData) -> Result<(), NodePoolError> {
        let info = self.node_pool_info(&*d)?;
        let name = node_pool_name_from_id(d.id()).to_string();
        let timeout = d.timeout(TimeoutKind::Delete);

        info!(node_pool = %name, "GKE NodePool is being deleted");
        self.delete_pool(&info, &name, timeout).await?;
        info!(node_pool = %name, "GKE NodePool deleted");
        d.set_id(String::new());
        Ok(())
    }

    /// Whether the pool exists.
    ///
    /// Errors other than not-found come back as `Err`; the pool should then
    /// be assumed to exist.
    #[instrument(skip(self, d), fields(id = %d.id()))]
    pub async fn exists(&self, d: &dyn ResourceData) -> Result<bool, NodePoolError> {
        let info = self.node_pool_info(d)?;
        let name = info.fully_qualified_name(node_pool_name_from_id(d.id()));
        match self.api.get_node_pool(&name, self.user_project(&info)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(NodePoolError::Api(e)),
        }
    }

    /// Adopt an existing pool by its fully-qualified id.
    #[instrument(skip(self))]
    pub async fn import(&self, id: &str) -> Result<StateData, NodePoolError> {
        let (info, name) = parse_node_pool_id(id)?;
        let mut d = StateData::new(json!({
            "project": info.project(),
            "location": info.location(),
            "cluster": info.cluster(),
            "name": name,
        }))
        .with_timeouts(self.config.timeouts);
        d.set_id(info.fully_qualified_name(&name));
        self.read(&mut d).await?;
        Ok(d)
    }

    /// Run the remaining steps of a blue/green replacement.
    ///
    /// Stops at the first failing step with
    /// [`NodePoolError::ReplacementInterrupted`]; nothing is rolled back.
    pub async fn replace(
        &self,
        info: &NodePoolInformation,
        mut plan: ReplacementPlan,
        create_timeout: Duration,
        delete_timeout: Duration,
    ) -> Result<(), NodePoolError> {
        for step in plan.remaining() {
            let target = plan.target(step).to_string();
            info!(step = %step, node_pool = %target, "Replacing GKE NodePool");

            let result = if step.is_create() {
                self.create_pool(info, &plan.pool_for(step), create_timeout)
                    .await
            } else {
                self.delete_pool(info, &target, delete_timeout).await
            };

            if let Err(source) = result {
                warn!(step = %step, error = %source, "Node pool replacement interrupted");
                return Err(NodePoolError::ReplacementInterrupted {
                    step,
                    completed: plan.completed().to_vec(),
                    source: Box::new(source),
                });
            }

            if step == ReplacementStep::CreateTemp {
                info!(
                    from = %plan.original(),
                    to = TEMP_NODE_POOL_NAME,
                    "Workloads can now migrate to the temporary node pool"
                );
            }
            plan.complete(step);
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Project to bill node pool calls to, when the provider overrides it.
    fn user_project<'a>(&self, info: &'a NodePoolInformation) -> Option<&'a str> {
        self.config
            .user_project_override
            .then(|| info.project())
    }

    /// Start a mutating call under the cluster lock, retrying failed preconditions.
    async fn submit<F, Fut>(
        &self,
        info: &NodePoolInformation,
        activity: &str,
        timeout: Duration,
        mut call: F,
    ) -> Result<Operation, NodePoolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Operation, ApiError>>,
    {
        let _guard = self.locks.lock(&info.lock_key()).await;

        let result = retry_until(&self.config.retry, timeout, activity, || {
            let pending = call();
            async move {
                pending.await.map_err(|e| {
                    if e.is_failed_precondition() {
                        RetryError::Retryable(e)
                    } else {
                        RetryError::Permanent(e)
                    }
                })
            }
        })
        .await;

        match result {
            Ok(op) => Ok(op),
            Err(RetryFailure::Permanent(e)) => Err(NodePoolError::Api(e)),
            Err(RetryFailure::TimedOut {
                last_error,
                timeout,
            }) => Err(NodePoolError::Timeout {
                activity: match last_error {
                    Some(e) => format!("{} ({})", activity, e),
                    None => activity.to_string(),
                },
                timeout,
            }),
        }
    }

    async fn wait_for(
        &self,
        info: &NodePoolInformation,
        op: &Operation,
        activity: &str,
        timeout: Duration,
    ) -> Result<Operation, NodePoolError> {
        await_operation(
            self.api.as_ref(),
            op,
            info.project(),
            info.location(),
            activity,
            timeout,
            self.config.poll_interval(),
        )
        .await
    }

    async fn wait_for_resting(
        &self,
        info: &NodePoolInformation,
        name: &str,
        timeout: Duration,
    ) -> Result<RestingStatus, NodePoolError> {
        await_resting_state(
            self.api.as_ref(),
            name,
            self.user_project(info),
            timeout,
            self.config.poll_interval(),
        )
        .await
    }

    /// Create `pool` and wait until it settles in a healthy state.
    async fn create_pool(
        &self,
        info: &NodePoolInformation,
        pool: &NodePool,
        timeout: Duration,
    ) -> Result<(), NodePoolError> {
        let start = Instant::now();
        let parent = info.parent();
        let user_project = self.user_project(info);
        let op = self
            .submit(info, CREATING, timeout, || {
                self.api.create_node_pool(&parent, pool, user_project)
            })
            .await?;
        self.wait_for(info, &op, CREATING, remaining(start, timeout))
            .await?;

        let status = self
            .wait_for_resting(info, &info.fully_qualified_name(&pool.name), timeout)
            .await?;
        if status.is_error() {
            return Err(NodePoolError::RestingState {
                name: pool.name.clone(),
                status: status.status,
            });
        }
        Ok(())
    }

    /// Delete the pool `name`, treating absence as success.
    async fn delete_pool(
        &self,
        info: &NodePoolInformation,
        name: &str,
        timeout: Duration,
    ) -> Result<(), NodePoolError> {
        let fq_name = info.fully_qualified_name(name);
        match self.wait_for_resting(info, &fq_name, timeout).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!(node_pool = %name, "GKE NodePool not found, doesn't need cleanup");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let start = Instant::now();
        let user_project = self.user_project(info);
        let op = match self
            .submit(info, DELETING, timeout, || {
                self.api.delete_node_pool(&fq_name, user_project)
            })
            .await
        {
            Ok(op) => op,
            Err(e) if e.is_not_found() => {
                info!(node_pool = %name, "GKE NodePool already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.wait_for(info, &op, DELETING, remaining(start, timeout))
            .await?;
        Ok(())
    }

    /// Mean target size over the instance groups that still exist, and their URLs.
    async fn current_node_count(
        &self,
        pool: &NodePool,
    ) -> Result<(i64, Vec<String>), NodePoolError> {
        let mut size = 0;
        let mut urls = Vec::new();
        for url in &pool.instance_group_urls {
            let group = InstanceGroupRef::parse(url)?;
            match self.api.get_instance_group_manager(&group).await {
                Ok(manager) => {
                    size += manager.target_size;
                    urls.push(url.clone());
                }
                Err(e) if e.is_not_found() => {
                    debug!(url = %url, "Skipping stale instance group URL");
                }
                Err(e) => return Err(NodePoolError::Api(e)),
            }
        }
        let node_count = if urls.is_empty() {
            0
        } else {
            size / urls.len() as i64
        };
        Ok((node_count, urls))
    }
}
