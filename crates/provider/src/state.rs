//! Runtime-property keys and helpers
//!
//! Keys the engine and the task functions read from and write to a node
//! instance's persisted bag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use vcloud_common::{DynamicValue, Element, RuntimeProperties};

pub const RESOURCE_ID: &str = "resource_id";
pub const RESOURCE_CONFIG: &str = "resource_config";
pub const USE_EXTERNAL_RESOURCE: &str = "use_external_resource";
pub const DATA: &str = "data";
pub const TASKS: &str = "tasks";
pub const CREATED: &str = "__created";
pub const DELETED: &str = "__deleted";
/// Sticky flag: the last attempt failed transiently
pub const RETRY_BAD_REQUEST: &str = "__RETRY_BAD_REQUEST";
/// The VM instantiated its own vApp and owns its deletion
pub const VM_CREATE_VAPP: &str = "__VM_CREATE_VAPP";

pub const NETWORK: &str = "network";
pub const SERVER: &str = "server";
pub const PORT: &str = "port";
pub const NIC_INDEX: &str = "nic_index";
/// NIC indexes the VM had before this NIC was added to it
pub const NIC_PRIOR_INDEXES: &str = "__NIC_PRIOR_INDEXES";
pub const VAPP: &str = "vapp";

/// Remote task snapshots grouped by category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHistory(BTreeMap<String, Vec<Value>>);

impl Default for TaskHistory {
    fn default() -> Self {
        let mut history = BTreeMap::new();
        for category in ["create", "delete", "update"] {
            history.insert(category.to_string(), Vec::new());
        }
        Self(history)
    }
}

impl TaskHistory {
    /// Seed from a persisted `tasks` value; anything unreadable starts fresh.
    pub fn from_persisted(value: Option<&Value>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Record the attribute pairs of a task, as plain data.
    pub fn record(&mut self, category: &str, task: &Element) {
        let snapshot = DynamicValue::List(task.items()).to_plain();
        self.0.entry(category.to_string()).or_default().push(snapshot);
    }

    pub fn get(&self, category: &str) -> &[Value] {
        self.0.get(category).map(Vec::as_slice).unwrap_or_default()
    }

    /// First value of `key` among the pairs of the first task in `category`.
    pub fn identifier(&self, category: &str, key: &str) -> Option<String> {
        let first = self.get(category).first()?.as_array()?;
        first
            .iter()
            .find_map(|pair| pair.get(key).and_then(Value::as_str))
            .map(str::to_string)
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), Value::Array(v.clone())))
            .collect();
        Value::Object(map)
    }
}

/// String property of a bag
pub fn get_string(props: &RuntimeProperties, key: &str) -> Option<String> {
    props.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Bool property of a bag with a default
pub fn get_flag(props: &RuntimeProperties, key: &str) -> bool {
    props.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// String nested under `data`, such as a VM's vApp name
pub fn get_data_string(props: &RuntimeProperties, key: &str) -> Option<String> {
    props
        .get(DATA)
        .and_then(|data| data.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Merge `update` into `props`, overwriting existing keys
pub fn merge(props: &mut RuntimeProperties, update: RuntimeProperties) {
    for (key, value) in update {
        props.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_defaults() {
        let history = TaskHistory::from_persisted(None);
        assert_eq!(
            history.to_value(),
            json!({"create": [], "delete": [], "update": []})
        );
    }

    #[test]
    fn test_record_and_identifier() {
        let mut history = TaskHistory::default();
        let task = Element::new("Task")
            .with_attr("id", "urn:task:1")
            .with_attr("href", "https://vcd/api/disk/d1");
        history.record("create", &task);

        assert_eq!(
            history.identifier("create", "href").as_deref(),
            Some("https://vcd/api/disk/d1")
        );
        assert_eq!(history.identifier("delete", "href"), None);

        let restored = TaskHistory::from_persisted(Some(&history.to_value()));
        assert_eq!(restored, history);
    }

    #[test]
    fn test_data_string() {
        let props = json!({"data": {"vapp": "web"}}).as_object().cloned().unwrap();
        assert_eq!(get_data_string(&props, "vapp").as_deref(), Some("web"));
        assert!(!get_flag(&props, VM_CREATE_VAPP));
    }
}
