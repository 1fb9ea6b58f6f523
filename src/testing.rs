//! Testing utilities for node pool lifecycles.
//!
//! [`MockContainerApi`] is an in-memory [`ContainerApi`] that records every
//! call and lets tests script operation outcomes, status sequences, instance
//! group sizes, and failures.
//!
//! # Example
//!
//! ```ignore
//! use gke_node_pool_provider::testing::MockContainerApi;
//! use gke_node_pool_provider::api::ApiError;
//!
//! let api = MockContainerApi::new();
//! api.fail_next("create_node_pool", ApiError::FailedPrecondition("busy".into()));
//! // ... run a create through a controller built on `Arc::new(api)` ...
//! assert_eq!(api.count_calls("create_node_pool"), 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{
    ApiError, ContainerApi, InstanceGroupManager, InstanceGroupRef, NodePoolUpdate, Operation,
    OperationStatus,
};
use crate::types::{node_pool_name_from_id, NodePool, NodePoolAutoscaling};

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Trait method name, e.g. `create_node_pool`.
    pub method: &'static str,
    /// The resource the call addressed.
    pub target: String,
    /// Project the call was billed to, if overridden.
    pub user_project: Option<String>,
}

struct ScriptedOperation {
    statuses: VecDeque<OperationStatus>,
    error: Option<String>,
}

struct InjectedFailure {
    method: String,
    pool: Option<String>,
    error: ApiError,
}

#[derive(Default)]
struct MockState {
    node_pools: HashMap<String, NodePool>,
    status_scripts: HashMap<String, VecDeque<String>>,
    operations: HashMap<String, ScriptedOperation>,
    instance_groups: HashMap<(String, String, String), i64>,
    failures: Vec<InjectedFailure>,
    failing_operations: VecDeque<String>,
    calls: Vec<Call>,
    updates: Vec<(String, NodePoolUpdate)>,
    create_status: Option<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight_per_cluster: HashMap<String, usize>,
    in_flight_total: usize,
    max_in_flight_total: usize,
}

/// In-memory container API for tests.
#[derive(Default)]
pub struct MockContainerApi {
    state: Mutex<MockState>,
    next_operation: AtomicU64,
    call_delay: Mutex<Duration>,
}

impl MockContainerApi {
    /// Create an empty backend. Created node pools come up `RUNNING`.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Store `pool` under the fully-qualified `name`.
    pub fn insert_node_pool(&self, name: &str, pool: NodePool) {
        self.state().node_pools.insert(name.to_string(), pool);
    }

    /// The stored node pool `name`.
    pub fn node_pool(&self, name: &str) -> Option<NodePool> {
        self.state().node_pools.get(name).cloned()
    }

    /// Fully-qualified names of every stored node pool, sorted.
    pub fn node_pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().node_pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Successive `get_node_pool(name)` calls report these statuses; the last one sticks.
    pub fn script_statuses(&self, name: &str, statuses: &[&str]) {
        self.state().status_scripts.insert(
            name.to_string(),
            statuses.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Successive `get_operation(name)` calls report these statuses; the last one
    /// sticks. `error` is attached once the operation is done.
    pub fn script_operation(&self, name: &str, statuses: &[OperationStatus], error: Option<&str>) {
        self.state().operations.insert(
            name.to_string(),
            ScriptedOperation {
                statuses: statuses.iter().copied().collect(),
                error: error.map(str::to_string),
            },
        );
    }

    /// The next mutating call finishes with a failed operation carrying `message`.
    /// A failed create leaves no node pool behind.
    pub fn fail_next_operation(&self, message: &str) {
        self.state()
            .failing_operations
            .push_back(message.to_string());
    }

    /// The next call to `method` fails with `error`.
    pub fn fail_next(&self, method: &str, error: ApiError) {
        self.state().failures.push(InjectedFailure {
            method: method.to_string(),
            pool: None,
            error,
        });
    }

    /// The next call to `method` addressing the node pool named `pool` fails with `error`.
    pub fn fail_next_on(&self, method: &str, pool: &str, error: ApiError) {
        self.state().failures.push(InjectedFailure {
            method: method.to_string(),
            pool: Some(pool.to_string()),
            error,
        });
    }

    /// Status given to node pools created from now on.
    pub fn set_create_status(&self, status: &str) {
        self.state().create_status = Some(status.to_string());
    }

    /// Register an instance group manager at `url` with `target_size`.
    pub fn insert_instance_group(&self, url: &str, target_size: i64) {
        if let Ok(group) = InstanceGroupRef::parse(url) {
            self.state()
                .instance_groups
                .insert((group.project, group.zone, group.name), target_size);
        }
    }

    /// Make create and delete submissions take `delay`.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of calls to `method`.
    pub fn count_calls(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Mutating calls as `"<verb> <node pool name>"`, e.g. `"create temp-node-pool"`.
    ///
    /// Retried submissions show up once per attempt.
    pub fn mutations(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| {
                let verb = match c.method {
                    "create_node_pool" => "create",
                    "update_node_pool" => "update",
                    "delete_node_pool" => "delete",
                    _ => return None,
                };
                Some(format!("{} {}", verb, node_pool_name_from_id(&c.target)))
            })
            .collect()
    }

    /// Patches applied so far, with their fully-qualified targets.
    pub fn updates(&self) -> Vec<(String, NodePoolUpdate)> {
        self.state().updates.clone()
    }

    /// Highest number of create/delete submissions seen in flight at once
    /// against the cluster `parent`.
    pub fn max_in_flight(&self, parent: &str) -> usize {
        self.state()
            .max_in_flight_per_cluster
            .get(parent)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of create/delete submissions seen in flight at once overall.
    pub fn max_in_flight_total(&self) -> usize {
        self.state().max_in_flight_total
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn record(
        &self,
        method: &'static str,
        target: &str,
        user_project: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(Call {
            method,
            target: target.to_string(),
            user_project: user_project.map(str::to_string),
        });
        let pool = node_pool_name_from_id(target);
        let index = state.failures.iter().position(|f| {
            f.method == method && f.pool.as_deref().map_or(true, |p| p == pool)
        });
        match index {
            Some(i) => Err(state.failures.remove(i).error),
            None => Ok(()),
        }
    }

    fn new_operation(&self, operation_type: &str, target: &str) -> (Operation, Option<String>) {
        let id = self.next_operation.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = self.state().failing_operations.pop_front();
        let op = Operation {
            name: format!("operation-{}", id),
            operation_type: operation_type.to_string(),
            status: OperationStatus::Running,
            target_link: target.to_string(),
            ..Default::default()
        };
        if let Some(message) = &failure {
            self.script_operation(&op.name, &[OperationStatus::Done], Some(message));
        }
        (op, failure)
    }

    async fn enter(&self, cluster: &str) {
        {
            let mut state = self.state();
            let count = {
                let entry = state.in_flight.entry(cluster.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            let max = state
                .max_in_flight_per_cluster
                .entry(cluster.to_string())
                .or_insert(0);
            *max = (*max).max(count);
            state.in_flight_total += 1;
            state.max_in_flight_total = state.max_in_flight_total.max(state.in_flight_total);
        }
        let delay = *self.call_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self, cluster: &str) {
        let mut state = self.state();
        if let Some(count) = state.in_flight.get_mut(cluster) {
            *count = count.saturating_sub(1);
        }
        state.in_flight_total = state.in_flight_total.saturating_sub(1);
    }
}

fn cluster_of(name: &str) -> &str {
    name.split("/nodePools/").next().unwrap_or(name)
}

#[async_trait]
impl ContainerApi for MockContainerApi {
    async fn create_node_pool(
        &self,
        parent: &str,
        node_pool: &NodePool,
        user_project: Option<&str>,
    ) -> Result<Operation, ApiError> {
        let name = format!("{}/nodePools/{}", parent, node_pool.name);
        self.enter(parent).await;
        let result = self.record("create_node_pool", &name, user_project).and_then(|_| {
            if self.state().node_pools.contains_key(&name) {
                return Err(ApiError::Other {
                    code: 409,
                    message: format!("Already exists: {}", name),
                });
            }
            let (op, failure) = self.new_operation("CREATE_NODE_POOL", &name);
            if failure.is_none() {
                let mut state = self.state();
                let mut pool = node_pool.clone();
                pool.status = state
                    .create_status
                    .clone()
                    .unwrap_or_else(|| "RUNNING".to_string());
                state.node_pools.insert(name.clone(), pool);
            }
            Ok(op)
        });
        self.leave(parent);
        result
    }

    async fn get_node_pool(
        &self,
        name: &str,
        user_project: Option<&str>,
    ) -> Result<NodePool, ApiError> {
        self.record("get_node_pool", name, user_project)?;
        let mut state = self.state();
        let next_status = state.status_scripts.get_mut(name).and_then(|script| {
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        });
        match state.node_pools.get_mut(name) {
            Some(pool) => {
                if let Some(status) = next_status {
                    pool.status = status;
                }
                Ok(pool.clone())
            }
            None => Err(ApiError::NotFound(format!("NodePool {} not found", name))),
        }
    }

    async fn update_node_pool(
        &self,
        name: &str,
        update: &NodePoolUpdate,
        user_project: Option<&str>,
    ) -> Result<Operation, ApiError> {
        self.record("update_node_pool", name, user_project)?;
        {
            let mut state = self.state();
            state.updates.push((name.to_string(), update.clone()));
            let pool = state
                .node_pools
                .get_mut(name)
                .ok_or_else(|| ApiError::NotFound(format!("NodePool {} not found", name)))?;
            for field in &update.update_mask {
                match field.as_str() {
                    "autoscaling" => pool.autoscaling = update.autoscaling,
                    "management" => pool.management = update.management.unwrap_or_default(),
                    "version" => pool.version = update.version.clone().unwrap_or_default(),
                    "locations" => {
                        pool.locations = update
                            .locations
                            .clone()
                            .unwrap_or_default()
                            .into_iter()
                            .collect()
                    }
                    "upgradeSettings" => pool.upgrade_settings = update.upgrade_settings,
                    _ => {}
                }
            }
            if pool
                .autoscaling
                .is_some_and(|a: NodePoolAutoscaling| !a.enabled)
            {
                pool.autoscaling = None;
            }
        }
        Ok(self.new_operation("UPDATE_NODE_POOL", name).0)
    }

    async fn delete_node_pool(
        &self,
        name: &str,
        user_project: Option<&str>,
    ) -> Result<Operation, ApiError> {
        let cluster = cluster_of(name).to_string();
        self.enter(&cluster).await;
        let result = self.record("delete_node_pool", name, user_project).and_then(|_| {
            if !self.state().node_pools.contains_key(name) {
                return Err(ApiError::NotFound(format!("NodePool {} not found", name)));
            }
            let (op, failure) = self.new_operation("DELETE_NODE_POOL", name);
            if failure.is_none() {
                self.state().node_pools.remove(name);
            }
            Ok(op)
        });
        self.leave(&cluster);
        result
    }

    async fn get_operation(
        &self,
        _project: &str,
        _location: &str,
        operation: &str,
    ) -> Result<Operation, ApiError> {
        self.record("get_operation", operation, None)?;
        let mut state = self.state();
        let (status, error) = match state.operations.get_mut(operation) {
            Some(script) => {
                let next = if script.statuses.len() > 1 {
                    script.statuses.pop_front()
                } else {
                    script.statuses.front().copied()
                };
                let status = next.unwrap_or(OperationStatus::Done);
                let error = if status == OperationStatus::Done {
                    script.error.clone()
                } else {
                    None
                };
                (status, error)
            }
            None => (OperationStatus::Done, None),
        };
        Ok(Operation {
            name: operation.to_string(),
            status,
            error,
            ..Default::default()
        })
    }

    async fn get_instance_group_manager(
        &self,
        group: &InstanceGroupRef,
    ) -> Result<InstanceGroupManager, ApiError> {
        self.record("get_instance_group_manager", &group.name, None)?;
        self.state()
            .instance_groups
            .get(&(group.project.clone(), group.zone.clone(), group.name.clone()))
            .map(|&target_size| InstanceGroupManager { target_size })
            .ok_or_else(|| ApiError::NotFound(format!("instance group manager {}", group.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARENT: &str = "projects/p/locations/l/clusters/c";

    fn pool(name: &str) -> NodePool {
        NodePool {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let api = MockContainerApi::new();
        let op = api.create_node_pool(PARENT, &pool("np"), None).await.unwrap();
        assert_eq!(op.status, OperationStatus::Running);

        let name = format!("{}/nodePools/np", PARENT);
        let stored = api.get_node_pool(&name, None).await.unwrap();
        assert_eq!(stored.status, "RUNNING");

        api.delete_node_pool(&name, None).await.unwrap();
        assert!(api.get_node_pool(&name, None).await.unwrap_err().is_not_found());
        assert!(api.delete_node_pool(&name, None).await.unwrap_err().is_not_found());

        assert_eq!(api.mutations(), vec!["create np", "delete np", "delete np"]);
    }

    #[tokio::test]
    async fn test_records_user_project() {
        let api = MockContainerApi::new();
        api.create_node_pool(PARENT, &pool("np"), Some("billing"))
            .await
            .unwrap();
        api.get_operation("p", "l", "operation-1").await.unwrap();

        let calls = api.calls();
        assert_eq!(calls[0].user_project.as_deref(), Some("billing"));
        assert_eq!(calls[1].user_project, None);
    }

    #[tokio::test]
    async fn test_targeted_failures() {
        let api = MockContainerApi::new();
        api.fail_next_on(
            "create_node_pool",
            "b",
            ApiError::FailedPrecondition("busy".to_string()),
        );

        assert!(api.create_node_pool(PARENT, &pool("a"), None).await.is_ok());
        assert!(api
            .create_node_pool(PARENT, &pool("b"), None)
            .await
            .unwrap_err()
            .is_failed_precondition());
        assert!(api.create_node_pool(PARENT, &pool("b"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_operation_leaves_nothing() {
        let api = MockContainerApi::new();
        api.fail_next_operation("quota");
        let op = api.create_node_pool(PARENT, &pool("np"), None).await.unwrap();

        let polled = api.get_operation("p", "l", &op.name).await.unwrap();
        assert_eq!(polled.status, OperationStatus::Done);
        assert_eq!(polled.error.as_deref(), Some("quota"));
        assert!(api.node_pool_names().is_empty());
    }

    #[tokio::test]
    async fn test_status_script_last_value_sticks() {
        let api = MockContainerApi::new();
        let name = format!("{}/nodePools/np", PARENT);
        api.insert_node_pool(&name, pool("np"));
        api.script_statuses(&name, &["PROVISIONING", "RUNNING"]);

        assert_eq!(api.get_node_pool(&name, None).await.unwrap().status, "PROVISIONING");
        assert_eq!(api.get_node_pool(&name, None).await.unwrap().status, "RUNNING");
        assert_eq!(api.get_node_pool(&name, None).await.unwrap().status, "RUNNING");
    }
}
