//! Provider configuration.
//!
//! The host hands the provider block over as JSON; [`ProviderConfig`] reads it
//! and fills unset values from the usual Google Cloud environment variables.
//!
//! ```
//! use gke_node_pool_provider::config::ProviderConfig;
//! use serde_json::json;
//!
//! let config = ProviderConfig::from_value(json!({
//!     "project": "my-project",
//!     "region": "us-central1",
//!     "poll_interval_ms": 5000
//! }))
//! .unwrap();
//! assert_eq!(config.project.as_deref(), Some("my-project"));
//! assert_eq!(config.timeouts.create_secs, 1800);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NodePoolError;
use crate::operation::DEFAULT_POLL_INTERVAL;
use crate::resource_data::ResourceData;
use crate::retry::RetryConfig;

const PROJECT_ENV_VARS: &[&str] = &[
    "GOOGLE_PROJECT",
    "GOOGLE_CLOUD_PROJECT",
    "GCLOUD_PROJECT",
    "CLOUDSDK_CORE_PROJECT",
];
const REGION_ENV_VARS: &[&str] = &["GOOGLE_REGION", "GCLOUD_REGION", "CLOUDSDK_COMPUTE_REGION"];
const ZONE_ENV_VARS: &[&str] = &["GOOGLE_ZONE", "GCLOUD_ZONE", "CLOUDSDK_COMPUTE_ZONE"];

/// Which lifecycle call a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Create, including the blue/green sub-steps.
    Create,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

/// Per-call deadlines, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Create deadline.
    pub create_secs: u64,
    /// Update deadline.
    pub update_secs: u64,
    /// Delete deadline.
    pub delete_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create_secs: 30 * 60,
            update_secs: 30 * 60,
            delete_secs: 30 * 60,
        }
    }
}

impl Timeouts {
    /// The same deadline for every call.
    pub fn uniform(timeout: Duration) -> Self {
        let secs = timeout.as_secs();
        Self {
            create_secs: secs,
            update_secs: secs,
            delete_secs: secs,
        }
    }

    /// Deadline for `kind`.
    pub fn get(&self, kind: TimeoutKind) -> Duration {
        Duration::from_secs(match kind {
            TimeoutKind::Create => self.create_secs,
            TimeoutKind::Update => self.update_secs,
            TimeoutKind::Delete => self.delete_secs,
        })
    }
}

/// Provider-level settings shared by every node pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Default project for resources that do not set one.
    pub project: Option<String>,
    /// Default region.
    pub region: Option<String>,
    /// Default zone; preferred over `region` as a location fallback.
    pub zone: Option<String>,
    /// Bill node pool requests to the resource's project instead of the
    /// credentials' project.
    pub user_project_override: bool,
    /// Interval between operation and status polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Backoff for retrying failed-precondition rejections.
    pub retry: RetryConfig,
    /// Default per-call deadlines.
    pub timeouts: Timeouts,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            project: None,
            region: None,
            zone: None,
            user_project_override: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            retry: RetryConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ProviderConfig {
    /// Parse the provider block. `null` yields the defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self, NodePoolError> {
        let config: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Fill unset project, region and zone from the environment.
    pub fn with_env_defaults(self) -> Self {
        self.with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ProviderConfig::with_env_defaults`] with a custom variable source.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .find(|value| !value.is_empty())
        };
        if is_unset(&self.project) {
            self.project = first(PROJECT_ENV_VARS);
        }
        if is_unset(&self.region) {
            self.region = first(REGION_ENV_VARS);
        }
        if is_unset(&self.zone) {
            self.zone = first(ZONE_ENV_VARS);
        }
        self
    }

    /// Reject settings the lifecycle cannot run with.
    pub fn validate(&self) -> Result<(), NodePoolError> {
        if self.poll_interval_ms == 0 {
            return Err(NodePoolError::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(NodePoolError::Configuration(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Interval between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The resource's `project`, else the provider default.
    pub fn project_for(&self, d: &dyn ResourceData) -> Result<String, NodePoolError> {
        if let Some(project) = d.get_str("project") {
            return Ok(project);
        }
        match &self.project {
            Some(project) if !project.is_empty() => Ok(project.clone()),
            _ => Err(NodePoolError::Configuration(
                "project: required field is not set".to_string(),
            )),
        }
    }

    /// The resource's `location`, else the provider zone, else the provider region.
    pub fn location_for(&self, d: &dyn ResourceData) -> Result<String, NodePoolError> {
        if let Some(location) = d.get_str("location") {
            return Ok(location);
        }
        [&self.zone, &self.region]
            .into_iter()
            .flatten()
            .find(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| {
                NodePoolError::Configuration(
                    "location: required field is not set, and no provider zone or region is configured"
                        .to_string(),
                )
            })
    }
}

fn is_unset(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}
