//! GKE Node Pool Provider
//!
//! This crate manages the lifecycle of Google Kubernetes Engine node pools:
//! create, read, update, delete and existence checks, driven through the
//! container API's long-running operations.
//!
//! # Overview
//!
//! - **Operation poller** ([`operation`]): waits for a remote operation to finish
//! - **Resting-state waiter** ([`resting`]): waits until a node pool stops transitioning
//! - **Cluster locks** ([`mutex`]): serialize mutating calls against one cluster
//! - **Lifecycle controller** ([`node_pool`]): CRUD, import, state migration,
//!   and blue/green replacement for changes that cannot be applied in place
//! - **Provider surface** ([`service`]): JSON-state entry points for a host
//! - **Error types** and **logging** in the crate's usual `thiserror`/`tracing` style
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gke_node_pool_provider::{NodePoolProvider, ProviderService, NODE_POOL_RESOURCE};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     gke_node_pool_provider::init_logging();
//!
//!     let provider = NodePoolProvider::new(Arc::new(MyContainerClient::new()));
//!     provider.configure(serde_json::json!({"project": "my-project"})).await?;
//!
//!     let state = provider
//!         .create(
//!             NODE_POOL_RESOURCE,
//!             serde_json::json!({
//!                 "cluster": "prod",
//!                 "location": "us-central1",
//!                 "name": "default",
//!                 "node_count": 3
//!             }),
//!         )
//!         .await?;
//!     println!("{}", state["id"]);
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Mutating calls against the same cluster are started one at a time, under a
//! lock keyed by `google-container-cluster/{project}/{location}/{cluster}`.
//! The lock covers only the call that starts an operation; waiting for the
//! operation happens outside it. Calls rejected because the cluster is busy
//! with another operation are retried until the call's deadline.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod mutex;
pub mod node_pool;
pub mod operation;
pub mod resource_data;
pub mod resting;
pub mod retry;
pub mod service;
pub mod testing;
pub mod types;

// Re-export main types at crate root
pub use api::{ApiError, ContainerApi, Operation, OperationStatus};
pub use config::{ProviderConfig, TimeoutKind, Timeouts};
pub use error::NodePoolError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use mutex::{KeyGuard, MutexKv};
pub use node_pool::{NodePoolController, ReplacementPlan, ReplacementStep};
pub use operation::await_operation;
pub use resource_data::{ResourceData, StateData};
pub use resting::{await_resting_state, RestingState, RestingStatus};
pub use service::{ApplyError, NodePoolProvider, ProviderService, NODE_POOL_RESOURCE};
pub use types::{AttributeChange, NodePool, NodePoolInformation};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
