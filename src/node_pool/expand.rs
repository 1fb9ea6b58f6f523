//! Mapping between resource state and the API's node pool representation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::api::NodePoolUpdate;
use crate::error::NodePoolError;
use crate::resource_data::ResourceData;
use crate::types::{
    AttributeChange, MaxPodsConstraint, NodeManagement, NodePool, NodePoolAutoscaling,
    UpgradeSettings,
};

/// Prefix of generated node pool names when neither `name` nor `name_prefix` is set.
pub const UNIQUE_ID_PREFIX: &str = "tf-";

static UNIQUE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `prefix` followed by a millisecond timestamp and a process-wide counter.
///
/// Successive ids sort in creation order.
pub fn prefixed_unique_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let counter = UNIQUE_ID_COUNTER.fetch_add(1, Ordering::SeqCst) % 100_000_000;
    format!("{}{}{:08}", prefix, millis, counter)
}

/// Build the node pool to create from resource state.
pub fn expand_node_pool(d: &dyn ResourceData) -> Result<NodePool, NodePoolError> {
    let name = match (d.get_str("name"), d.get_str("name_prefix")) {
        (Some(_), Some(_)) => {
            return Err(NodePoolError::Configuration(
                "Cannot specify both name and name_prefix for a node pool".to_string(),
            ))
        }
        (Some(name), None) => name,
        (None, Some(prefix)) => prefixed_unique_id(&prefix),
        (None, None) => prefixed_unique_id(UNIQUE_ID_PREFIX),
    };

    let initial_node_count = d.get_i64("initial_node_count");
    let node_count = d.get_i64("node_count");
    if initial_node_count.is_some() && node_count.is_some() {
        return Err(NodePoolError::Configuration(format!(
            "Cannot set both initial_node_count and node_count on node pool {}",
            name
        )));
    }

    build(d, name, initial_node_count.or(node_count).unwrap_or(0))
}

/// Build the pool that replaces `name` during a blue/green update.
///
/// State read back from the service carries both counts, so they are not
/// exclusive here: a changed `initial_node_count` wins, then the current
/// `node_count`.
pub(crate) fn expand_replacement(
    d: &dyn ResourceData,
    name: &str,
) -> Result<NodePool, NodePoolError> {
    let changed_initial = if d.has_change("initial_node_count") {
        d.get_i64("initial_node_count")
    } else {
        None
    };
    let count = changed_initial
        .or_else(|| d.get_i64("node_count"))
        .or_else(|| d.get_i64("initial_node_count"))
        .unwrap_or(0);
    build(d, name.to_string(), count)
}

fn build(
    d: &dyn ResourceData,
    name: String,
    initial_node_count: i64,
) -> Result<NodePool, NodePoolError> {
    Ok(NodePool {
        name,
        initial_node_count,
        config: d.get("node_config").unwrap_or(Value::Null),
        locations: expand_locations(d)?.into_iter().collect(),
        version: d.get_str("version").unwrap_or_default(),
        autoscaling: expand_autoscaling(d),
        max_pods_constraint: d
            .get_i64("max_pods_per_node")
            .map(|max_pods_per_node| MaxPodsConstraint { max_pods_per_node }),
        management: expand_management(d),
        upgrade_settings: expand_upgrade_settings(d),
        ..Default::default()
    })
}

fn int_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn expand_locations(d: &dyn ResourceData) -> Result<Vec<String>, NodePoolError> {
    match d.get_ok("node_locations") {
        Some(value) => {
            let set: BTreeSet<String> = serde_json::from_value(value)?;
            Ok(set.into_iter().collect())
        }
        None => Ok(Vec::new()),
    }
}

fn expand_autoscaling(d: &dyn ResourceData) -> Option<NodePoolAutoscaling> {
    d.get_ok("autoscaling").map(|v| NodePoolAutoscaling {
        enabled: true,
        min_node_count: int_field(&v, "min_node_count"),
        max_node_count: int_field(&v, "max_node_count"),
    })
}

fn expand_management(d: &dyn ResourceData) -> NodeManagement {
    d.get_ok("management")
        .map(|v| NodeManagement {
            auto_repair: bool_field(&v, "auto_repair"),
            auto_upgrade: bool_field(&v, "auto_upgrade"),
        })
        .unwrap_or_default()
}

fn expand_upgrade_settings(d: &dyn ResourceData) -> Option<UpgradeSettings> {
    d.get_ok("upgrade_settings").map(|v| UpgradeSettings {
        max_surge: int_field(&v, "max_surge"),
        max_unavailable: int_field(&v, "max_unavailable"),
    })
}

/// Resource state for `pool`.
///
/// `node_count` and `instance_group_urls` come from the live instance groups.
/// `name_prefix` is carried over from the existing state since the service
/// does not know about it. `autoscaling` and `upgrade_settings` are left out
/// when the service reports nothing, so existing state keeps its value.
pub fn flatten_node_pool(
    pool: &NodePool,
    node_count: i64,
    instance_group_urls: &[String],
    name_prefix: Option<Value>,
) -> Map<String, Value> {
    let mut state = Map::new();
    state.insert("name".to_string(), json!(pool.name));
    state.insert(
        "name_prefix".to_string(),
        name_prefix.unwrap_or_else(|| json!("")),
    );
    state.insert(
        "initial_node_count".to_string(),
        json!(pool.initial_node_count),
    );
    state.insert("node_locations".to_string(), json!(pool.locations));
    state.insert("node_count".to_string(), json!(node_count));
    state.insert("node_config".to_string(), pool.config.clone());
    state.insert(
        "instance_group_urls".to_string(),
        json!(instance_group_urls),
    );
    state.insert("version".to_string(), json!(pool.version));

    if let Some(autoscaling) = pool.autoscaling {
        let value = if autoscaling.enabled {
            json!({
                "min_node_count": autoscaling.min_node_count,
                "max_node_count": autoscaling.max_node_count,
            })
        } else {
            Value::Null
        };
        state.insert("autoscaling".to_string(), value);
    }

    if let Some(constraint) = pool.max_pods_constraint {
        state.insert(
            "max_pods_per_node".to_string(),
            json!(constraint.max_pods_per_node),
        );
    }

    state.insert(
        "management".to_string(),
        json!({
            "auto_repair": pool.management.auto_repair,
            "auto_upgrade": pool.management.auto_upgrade,
        }),
    );

    if let Some(settings) = pool.upgrade_settings {
        state.insert(
            "upgrade_settings".to_string(),
            json!({
                "max_surge": settings.max_surge,
                "max_unavailable": settings.max_unavailable,
            }),
        );
    }

    state.insert("status".to_string(), json!(pool.status));
    state
}

/// How a change to one attribute reaches the service.
struct UpdatableField {
    key: &'static str,
    /// Update mask entry, or `None` when only a replacement can apply the change.
    mask: Option<&'static str>,
    /// Server-filled when unset; an absent planned value is not a change.
    computed: bool,
}

const UPDATABLE_FIELDS: &[UpdatableField] = &[
    UpdatableField { key: "node_config", mask: None, computed: true },
    UpdatableField { key: "initial_node_count", mask: None, computed: true },
    UpdatableField { key: "max_pods_per_node", mask: None, computed: true },
    UpdatableField { key: "node_count", mask: Some("nodeCount"), computed: true },
    UpdatableField { key: "autoscaling", mask: Some("autoscaling"), computed: false },
    UpdatableField { key: "management", mask: Some("management"), computed: true },
    UpdatableField { key: "version", mask: Some("version"), computed: true },
    UpdatableField { key: "node_locations", mask: Some("locations"), computed: true },
    UpdatableField { key: "upgrade_settings", mask: Some("upgradeSettings"), computed: true },
];

fn field(key: &str) -> Option<&'static UpdatableField> {
    UPDATABLE_FIELDS.iter().find(|f| f.key == key)
}

fn normalize(key: &str, value: Option<Value>) -> Option<Value> {
    match (key, value) {
        ("node_locations", Some(Value::Array(mut items))) => {
            items.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
            items.dedup();
            Some(Value::Array(items))
        }
        (_, value) => value,
    }
}

/// Attributes whose planned value differs from the prior state.
pub(crate) fn changed_fields(d: &dyn ResourceData) -> Vec<AttributeChange> {
    UPDATABLE_FIELDS
        .iter()
        .filter_map(|f| {
            let (before, after) = d.get_change(f.key);
            let before = normalize(f.key, before);
            let after = normalize(f.key, after);
            if before == after || (f.computed && after.is_none()) {
                return None;
            }
            Some(AttributeChange::new(f.key, before, after))
        })
        .collect()
}

/// Whether any of `changes` can only be applied by replacing the pool.
pub(crate) fn requires_replacement(changes: &[AttributeChange]) -> bool {
    changes
        .iter()
        .any(|c| field(&c.path).is_some_and(|f| f.mask.is_none()))
}

/// A single patch carrying every in-place change.
pub(crate) fn expand_update(
    d: &dyn ResourceData,
    changes: &[AttributeChange],
) -> Result<NodePoolUpdate, NodePoolError> {
    let mut update = NodePoolUpdate::default();
    for change in changes {
        let Some(mask) = field(&change.path).and_then(|f| f.mask) else {
            continue;
        };
        match change.path.as_str() {
            "node_count" => {
                update.node_count = Some(
                    d.get("node_count")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0),
                )
            }
            "autoscaling" => update.autoscaling = Some(expand_autoscaling(d).unwrap_or_default()),
            "management" => update.management = Some(expand_management(d)),
            "version" => update.version = Some(d.get_str("version").unwrap_or_default()),
            "node_locations" => update.locations = Some(expand_locations(d)?),
            "upgrade_settings" => {
                update.upgrade_settings = Some(expand_upgrade_settings(d).unwrap_or_default())
            }
            _ => continue,
        }
        update.update_mask.push(mask.to_string());
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_data::StateData;

    #[test]
    fn test_expand_full() {
        let d = StateData::new(json!({
            "name": "np",
            "node_count": 2,
            "node_locations": ["us-east1-c", "us-east1-b"],
            "node_config": {"machine_type": "e2-standard-4"},
            "version": "1.29.1-gke.1",
            "autoscaling": {"min_node_count": 1, "max_node_count": 5},
            "max_pods_per_node": 32,
            "management": {"auto_repair": true},
            "upgrade_settings": {"max_surge": 1, "max_unavailable": 0}
        }));

        let pool = expand_node_pool(&d).unwrap();
        assert_eq!(pool.name, "np");
        assert_eq!(pool.initial_node_count, 2);
        assert_eq!(
            pool.locations.iter().collect::<Vec<_>>(),
            vec!["us-east1-b", "us-east1-c"]
        );
        assert_eq!(pool.config["machine_type"], "e2-standard-4");
        assert_eq!(
            pool.autoscaling,
            Some(NodePoolAutoscaling {
                enabled: true,
                min_node_count: 1,
                max_node_count: 5
            })
        );
        assert_eq!(pool.max_pods_constraint.unwrap().max_pods_per_node, 32);
        assert!(pool.management.auto_repair);
        assert!(!pool.management.auto_upgrade);
        assert_eq!(pool.upgrade_settings.unwrap().max_surge, 1);
    }

    #[test]
    fn test_expand_name_sources() {
        let d = StateData::new(json!({"name_prefix": "pool-"}));
        let name = expand_node_pool(&d).unwrap().name;
        assert!(name.starts_with("pool-"));
        assert!(name.len() > "pool-".len());

        let generated = expand_node_pool(&StateData::new(json!({}))).unwrap().name;
        assert!(generated.starts_with(UNIQUE_ID_PREFIX));

        let err = expand_node_pool(&StateData::new(json!({"name": "a", "name_prefix": "b"})))
            .unwrap_err();
        assert!(matches!(err, NodePoolError::Configuration(_)));
    }

    #[test]
    fn test_unique_ids_differ() {
        assert_ne!(prefixed_unique_id("p-"), prefixed_unique_id("p-"));
    }

    #[test]
    fn test_expand_rejects_both_counts() {
        let d = StateData::new(json!({"name": "np", "initial_node_count": 1, "node_count": 2}));
        let err = expand_node_pool(&d).unwrap_err();
        assert!(err.to_string().contains("initial_node_count and node_count"));

        let d = StateData::new(json!({"name": "np", "initial_node_count": 3, "node_count": 0}));
        assert_eq!(expand_node_pool(&d).unwrap().initial_node_count, 3);
    }

    #[test]
    fn test_expand_replacement_prefers_current_count() {
        let prior = json!({"name": "np", "initial_node_count": 1, "node_count": 4});
        let d = StateData::new(json!({
            "name": "np", "initial_node_count": 1, "node_count": 4,
            "node_config": {"machine_type": "n2-standard-2"}
        }))
        .with_prior(prior.clone());
        assert_eq!(expand_replacement(&d, "np").unwrap().initial_node_count, 4);

        let d = StateData::new(json!({"name": "np", "initial_node_count": 6, "node_count": 4}))
            .with_prior(prior);
        assert_eq!(expand_replacement(&d, "np").unwrap().initial_node_count, 6);
    }

    #[test]
    fn test_flatten() {
        let pool = NodePool {
            name: "np".to_string(),
            initial_node_count: 3,
            locations: ["us-east1-b".to_string()].into_iter().collect(),
            version: "1.29".to_string(),
            autoscaling: Some(NodePoolAutoscaling::default()),
            status: "RUNNING".to_string(),
            ..Default::default()
        };
        let urls = vec!["https://example/igm-a".to_string()];
        let state = flatten_node_pool(&pool, 4, &urls, Some(json!("pre-")));

        assert_eq!(state["name"], "np");
        assert_eq!(state["name_prefix"], "pre-");
        assert_eq!(state["node_count"], 4);
        assert_eq!(state["initial_node_count"], 3);
        assert_eq!(state["node_locations"], json!(["us-east1-b"]));
        assert_eq!(state["instance_group_urls"], json!(urls));
        assert_eq!(state["autoscaling"], Value::Null);
        assert_eq!(state["management"], json!({"auto_repair": false, "auto_upgrade": false}));
        assert!(!state.contains_key("upgrade_settings"));
        assert!(!state.contains_key("max_pods_per_node"));
    }

    #[test]
    fn test_changes_in_place_only() {
        let d = StateData::new(json!({
            "node_count": 5,
            "version": "1.29",
            "node_locations": ["b", "a"],
            "node_config": {"machine_type": "e2"}
        }))
        .with_prior(json!({
            "node_count": 3,
            "version": "1.29",
            "node_locations": ["a", "b"],
            "node_config": {"machine_type": "e2"},
            "autoscaling": {"min_node_count": 1, "max_node_count": 3}
        }));

        let changes = changed_fields(&d);
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["node_count", "autoscaling"]);
        assert!(!requires_replacement(&changes));

        let update = expand_update(&d, &changes).unwrap();
        assert_eq!(update.update_mask, vec!["nodeCount", "autoscaling"]);
        assert_eq!(update.node_count, Some(5));
        assert_eq!(update.autoscaling, Some(NodePoolAutoscaling::default()));
    }

    #[test]
    fn test_unset_computed_fields_are_not_changes() {
        let d = StateData::new(json!({"name": "np"}))
            .with_prior(json!({"name": "np", "version": "1.29", "node_count": 3}));
        assert!(changed_fields(&d).is_empty());
        assert!(expand_update(&d, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_node_config_change_requires_replacement() {
        let d = StateData::new(json!({"node_config": {"machine_type": "n2"}, "version": "1.30"}))
            .with_prior(json!({"node_config": {"machine_type": "e2"}, "version": "1.29"}));
        let changes = changed_fields(&d);
        assert!(requires_replacement(&changes));
        assert!(changes.iter().any(|c| c.path == "version"));
    }
}
