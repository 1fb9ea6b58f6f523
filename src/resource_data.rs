//! Access to the host's resource state.
//!
//! [`ResourceData`] is the only view the lifecycle has of a resource: typed
//! reads at a dotted path, the prior/planned pair for change detection,
//! writes, the identity, and the per-call deadlines. [`StateData`] implements
//! it over plain JSON state.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::{TimeoutKind, Timeouts};
use crate::error::NodePoolError;

/// Field-level access to one resource's state.
pub trait ResourceData: Send + Sync {
    /// The resource identity; empty when the resource does not exist.
    fn id(&self) -> &str;

    /// Replace the identity. An empty id marks the resource as gone.
    fn set_id(&mut self, id: String);

    /// The current value at `key` (dot-separated path), if present and non-null.
    fn get(&self, key: &str) -> Option<Value>;

    /// The prior and current values at `key`.
    fn get_change(&self, key: &str) -> (Option<Value>, Option<Value>);

    /// Write `value` at `key`, creating intermediate objects.
    fn set(&mut self, key: &str, value: Value) -> Result<(), NodePoolError>;

    /// Deadline for the given lifecycle call.
    fn timeout(&self, kind: TimeoutKind) -> Duration;

    /// The value at `key` unless it is the zero value of its type.
    fn get_ok(&self, key: &str) -> Option<Value> {
        self.get(key).filter(|v| !is_zero_value(v))
    }

    /// Non-empty string at `key`.
    fn get_str(&self, key: &str) -> Option<String> {
        self.get_ok(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Non-zero integer at `key`.
    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_ok(key).and_then(|v| v.as_i64())
    }

    /// Boolean at `key`, false when unset.
    fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Whether the value at `key` differs between prior and current state.
    fn has_change(&self, key: &str) -> bool {
        let (before, after) = self.get_change(key);
        before != after
    }
}

/// Whether `value` is what the host treats as "not set".
pub fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(root, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|v| !v.is_null())
}

/// [`ResourceData`] over JSON state.
///
/// `prior` is the last stored state (absent on create), `current` the planned
/// state the call should converge to. The identity lives beside the JSON and is
/// written back as `id` by [`StateData::into_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateData {
    id: String,
    prior: Option<Value>,
    current: Value,
    timeouts: Timeouts,
}

impl StateData {
    /// Wrap planned state; the identity is taken from its `id` field.
    pub fn new(current: Value) -> Self {
        let current = if current.is_null() {
            Value::Object(Map::new())
        } else {
            current
        };
        let id = current
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            id,
            prior: None,
            current,
            timeouts: Timeouts::default(),
        }
    }

    /// Attach the prior state used by [`ResourceData::get_change`].
    ///
    /// The identity comes from the prior state when the planned one has none.
    pub fn with_prior(mut self, prior: Value) -> Self {
        if self.id.is_empty() {
            if let Some(id) = prior.get("id").and_then(Value::as_str) {
                self.id = id.to_string();
            }
        }
        self.prior = Some(prior);
        self
    }

    /// Use `timeouts` instead of the defaults.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The current JSON, without the identity.
    pub fn current(&self) -> &Value {
        &self.current
    }

    /// Finish the call: the current state with `id` set, or `None` if the
    /// resource is gone.
    pub fn into_state(self) -> Option<Value> {
        if self.id.is_empty() {
            return None;
        }
        let mut state = self.current;
        if let Value::Object(map) = &mut state {
            map.insert("id".to_string(), Value::String(self.id));
        }
        Some(state)
    }
}

impl ResourceData for StateData {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn get(&self, key: &str) -> Option<Value> {
        lookup(&self.current, key).cloned()
    }

    fn get_change(&self, key: &str) -> (Option<Value>, Option<Value>) {
        let before = self.prior.as_ref().and_then(|p| lookup(p, key)).cloned();
        (before, self.get(key))
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), NodePoolError> {
        let mut segments: Vec<&str> = key.split('.').collect();
        let last = segments
            .pop()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NodePoolError::Configuration(format!("invalid field path {:?}", key)))?;

        let mut target = &mut self.current;
        for segment in segments {
            let map = target.as_object_mut().ok_or_else(|| {
                NodePoolError::Configuration(format!(
                    "cannot set {:?}: parent is not an object",
                    key
                ))
            })?;
            target = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
        }

        let map = target.as_object_mut().ok_or_else(|| {
            NodePoolError::Configuration(format!("cannot set {:?}: parent is not an object", key))
        })?;
        map.insert(last.to_string(), value);
        Ok(())
    }

    fn timeout(&self, kind: TimeoutKind) -> Duration {
        self.timeouts.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested_paths() {
        let d = StateData::new(json!({
            "name": "np",
            "autoscaling": {"min_node_count": 0, "max_node_count": 3},
            "node_locations": ["us-east1-b"],
            "version": null
        }));
        assert_eq!(d.get("name"), Some(json!("np")));
        assert_eq!(d.get("autoscaling.max_node_count"), Some(json!(3)));
        assert_eq!(d.get("node_locations.0"), Some(json!("us-east1-b")));
        assert_eq!(d.get("version"), None);
        assert_eq!(d.get("missing.path"), None);
    }

    #[test]
    fn test_get_ok_skips_zero_values() {
        let d = StateData::new(json!({
            "name": "",
            "node_count": 0,
            "initial_node_count": 2,
            "management": {},
            "node_locations": []
        }));
        assert!(d.get_ok("name").is_none());
        assert!(d.get("node_count").is_some());
        assert!(d.get_i64("node_count").is_none());
        assert_eq!(d.get_i64("initial_node_count"), Some(2));
        assert!(d.get_ok("management").is_none());
        assert!(d.get_ok("node_locations").is_none());
        assert!(!d.get_bool("management.auto_repair"));
    }

    #[test]
    fn test_get_change_and_has_change() {
        let node_config = json!({"machine_type": "e2-standard-4"});
        let d = StateData::new(json!({"version": "1.29", "node_config": node_config}))
            .with_prior(json!({"id": "x", "version": "1.28", "node_config": node_config}));

        assert_eq!(d.get_change("version"), (Some(json!("1.28")), Some(json!("1.29"))));
        assert!(d.has_change("version"));
        assert!(!d.has_change("node_config"));
        assert!(!d.has_change("autoscaling"));
        assert_eq!(d.id(), "x");
    }

    #[test]
    fn test_without_prior_everything_set_is_a_change() {
        let d = StateData::new(json!({"version": "1.29"}));
        assert!(d.has_change("version"));
        assert!(!d.has_change("autoscaling"));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut d = StateData::new(json!({"management": null}));
        d.set("management.auto_repair", json!(true)).unwrap();
        d.set("name", json!("np")).unwrap();
        assert_eq!(d.get("management.auto_repair"), Some(json!(true)));
        assert_eq!(d.current()["name"], "np");

        let mut d = StateData::new(json!({"name": "np"}));
        assert!(d.set("name.inner", json!(1)).is_err());
        assert!(d.set("", json!(1)).is_err());
    }

    #[test]
    fn test_into_state_round_trips_identity() {
        let mut d = StateData::new(json!({"name": "np"}));
        assert_eq!(d.id(), "");
        d.set_id("projects/p/locations/l/clusters/c/nodePools/np".to_string());
        let state = d.into_state().unwrap();
        assert_eq!(state["id"], "projects/p/locations/l/clusters/c/nodePools/np");

        let mut gone = StateData::new(json!({"id": "x"}));
        gone.set_id(String::new());
        assert!(gone.into_state().is_none());
    }

    #[test]
    fn test_timeouts() {
        let d = StateData::new(json!({})).with_timeouts(Timeouts::uniform(Duration::from_secs(5)));
        assert_eq!(d.timeout(TimeoutKind::Create), Duration::from_secs(5));
        assert_eq!(d.timeout(TimeoutKind::Delete), Duration::from_secs(5));
    }
}
