//! NIC adapter
//!
//! A NIC has no remote identity until it is plugged into a VM; until then it
//! is only its desired configuration.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use vcloud_common::{DynamicValue, Element};

use super::{record, Resource};
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

const DEFAULT_IP_MODE: &str = "DHCP";
const DEFAULT_ADAPTER: &str = "VMXNET3";

pub struct Nic {
    name: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    index: Option<i64>,
    tasks: TaskHistory,
}

impl Nic {
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        Self {
            name: descriptor.resource_id.clone(),
            client: descriptor.client.clone(),
            config: descriptor.resource_config.clone(),
            index: None,
            tasks: descriptor.tasks.clone(),
        }
    }

    pub fn with_index(mut self, index: Option<i64>) -> Self {
        self.index = index;
        self
    }

    pub fn index(&self) -> Option<i64> {
        self.index
    }

    pub fn network_name(&self) -> Option<&str> {
        self.config.get("network_name").and_then(Value::as_str)
    }

    /// Definition handed to the provider when the NIC is added to a VM.
    pub fn definition(&self) -> Map<String, Value> {
        let mut definition = Map::new();
        definition.insert(
            "network_name".to_string(),
            self.network_name().map(Value::from).unwrap_or(Value::Null),
        );
        definition.insert(
            "ip_address_mode".to_string(),
            self.config
                .get("ip_address_mode")
                .cloned()
                .unwrap_or_else(|| json!(DEFAULT_IP_MODE)),
        );
        definition.insert(
            "ip_address".to_string(),
            self.config.get("ip_address").cloned().unwrap_or(Value::Null),
        );
        definition.insert(
            "is_primary".to_string(),
            self.config.get("is_primary").cloned().unwrap_or(json!(false)),
        );
        definition.insert(
            "is_connected".to_string(),
            self.config.get("is_connected").cloned().unwrap_or(json!(true)),
        );
        definition.insert(
            "adapter_type".to_string(),
            self.config
                .get("adapter_type")
                .cloned()
                .unwrap_or_else(|| json!(DEFAULT_ADAPTER)),
        );
        definition
    }

    /// Remember the task that plugged or unplugged this NIC.
    pub fn record_task(&mut self, category: &str, result: &Element) {
        record(&mut self.tasks, category, result);
    }
}

#[async_trait]
impl Resource for Nic {
    fn type_name(&self) -> &'static str {
        "nic"
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
        let mut data = self.definition();
        if let Some(index) = self.index {
            data.insert("index".to_string(), json!(index));
        }
        Ok(DynamicValue::from(Value::Object(data)))
    }
}
