//! Upgrades of stored node pool state.

use serde_json::Value;
use tracing::info;

use crate::error::NodePoolError;

/// Version of the state layout written by this crate.
pub const SCHEMA_VERSION: u64 = 1;

/// Bring state written at `version` up to [`SCHEMA_VERSION`].
///
/// Version 0 addressed zonal clusters by `zone`; it becomes `location`.
pub fn migrate_state(version: u64, mut state: Value) -> Result<Value, NodePoolError> {
    if version > SCHEMA_VERSION {
        return Err(NodePoolError::Configuration(format!(
            "state version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }
    if version == 0 {
        let map = state.as_object_mut().ok_or_else(|| {
            NodePoolError::Configuration("node pool state must be an object".to_string())
        })?;
        let has_location = map.get("location").is_some_and(|v| !v.is_null());
        if !has_location {
            if let Some(zone) = map.get("zone").filter(|v| !v.is_null()).cloned() {
                info!(zone = %zone, "Migrating node pool state from zone to location");
                map.insert("location".to_string(), zone);
            }
        }
    }
    Ok(state)
}
