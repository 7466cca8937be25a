//! Resource Adapters
//!
//! One thin adapter per resource kind, wrapping the provider calls for that
//! kind and recording the tasks they start.

pub mod disk;
pub mod gateway;
pub mod iso;
pub mod media;
pub mod network;
pub mod nic;
pub mod vapp;
pub mod vm;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use vcloud_common::{DynamicValue, Element, PowerAction};

use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

pub use disk::Disk;
pub use gateway::Gateway;
pub use iso::IsoImage;
pub use media::Media;
pub use network::Network;
pub use nic::Nic;
pub use vapp::VApp;
pub use vm::Vm;

/// Common interface of every adapter
#[async_trait]
pub trait Resource: Send + Sync {
    /// Resource type name
    fn type_name(&self) -> &'static str;

    /// Identifying name; persisted as `resource_id`
    fn name(&self) -> &str;

    /// Client the adapter talks through; tasks it started are polled on it
    fn client(&self) -> &Arc<dyn VcdClient>;

    fn tasks(&self) -> &TaskHistory;

    /// Snapshot of the live remote state worth persisting
    async fn exposed_data(&self) -> ProviderResult<DynamicValue>;
}

/// Power transitions, for the kinds that have them
#[async_trait]
pub trait PowerControl: Resource {
    async fn power(&mut self, action: PowerAction) -> ProviderResult<Element>;
}

/// No-op adapter for the side of an operation without a remote resource of
/// its own, such as a rules node.
pub struct Placeholder {
    name: String,
    client: Arc<dyn VcdClient>,
    tasks: TaskHistory,
}

impl Placeholder {
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        Self {
            name: descriptor.resource_id.clone(),
            client: descriptor.client.clone(),
            tasks: TaskHistory::default(),
        }
    }
}

#[async_trait]
impl Resource for Placeholder {
    fn type_name(&self) -> &'static str {
        "placeholder"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn client(&self) -> &Arc<dyn VcdClient> {
        &self.client
    }

    fn tasks(&self) -> &TaskHistory {
        &self.tasks
    }

    async fn exposed_data(&self) -> ProviderResult<DynamicValue> {
        Ok(DynamicValue::Map(Default::default()))
    }
}

/// The task element inside a mutating call's answer.
pub(crate) fn task_element(result: &Element) -> Option<&Element> {
    if result.tag == "Task" {
        return Some(result);
    }
    result.child("Tasks")?.child("Task")
}

/// Record the task of `result` under `category`, if it carries one.
pub(crate) fn record(tasks: &mut TaskHistory, category: &str, result: &Element) {
    if let Some(task) = task_element(result) {
        tasks.record(category, task);
    }
}

/// Configuration without the keys an adapter consumes itself.
pub(crate) fn config_without(config: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    config
        .iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Text form of a configuration value, as the provider echoes it back.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_unwraps_entity_tasks() {
        let disk = Element::new("Disk")
            .with_attr("id", "urn:disk:1")
            .with_child(
                Element::new("Tasks").with_child(
                    Element::new("Task")
                        .with_attr("id", "t1")
                        .with_attr("status", "running"),
                ),
            );
        let mut tasks = TaskHistory::default();
        record(&mut tasks, "create", &disk);
        record(&mut tasks, "create", &Element::new("Disk"));
        assert_eq!(tasks.get("create").len(), 1);
        assert_eq!(tasks.identifier("create", "id").as_deref(), Some("t1"));
    }

    #[test]
    fn test_config_without() {
        let config = json!({"name": "d", "size": 10}).as_object().cloned().unwrap();
        let stripped = config_without(&config, &["name"]);
        assert_eq!(Value::Object(stripped), json!({"size": 10}));
        assert_eq!(value_text(&json!(10)), "10");
        assert_eq!(value_text(&json!("a")), "a");
    }
}
