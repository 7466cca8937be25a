//! Org VDC network adapter

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::value::make_map;
use vcloud_common::{DynamicValue, Element, NetworkType};

use super::{config_without, record, Resource};
use crate::classifier;
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

pub struct Network {
    name: String,
    network_type: NetworkType,
    vdc: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    tasks: TaskHistory,
}

impl Network {
    pub fn from_descriptor(descriptor: &ResourceDescriptor, network_type: NetworkType) -> Self {
        Self {
            name: descriptor.resource_id.clone(),
            network_type,
            vdc: descriptor.vdc.clone(),
            client: descriptor.client.clone(),
            config: config_without(&descriptor.resource_config, &["network_name"]),
            tasks: descriptor.tasks.clone(),
        }
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub async fn lookup(&self) -> ProviderResult<Element> {
        self.client
            .get_network(&self.vdc, self.network_type, &self.name)
            .await
    }

    /// Create the network; an existing network of the same name is returned
    /// as is.
    pub async fn create(&mut self) -> ProviderResult<Element> {
        debug!("Creating {} {}", self.network_type, self.name);
        match self
            .client
            .create_network(&self.vdc, self.network_type, &self.name, &self.config)
            .await
        {
            Ok(task) => {
                record(&mut self.tasks, "create", &task);
                Ok(task)
            }
            Err(err) if classifier::already_exists(&err) => {
                debug!("Network {} already exists: {}", self.name, err);
                self.lookup().await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&mut self) -> ProviderResult<Element> {
        debug!("Deleting {} {}", self.network_type, self.name);
        let task = self
            .client
            .delete_network(&self.vdc, self.network_type, &self.name)
            .await?;
        record(&mut self.tasks, "delete", &task);
        Ok(task)
    }
}

#[async_trait]
impl Resource for Network {
    fn type_name(&self) -> &'static str {
        "network"
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
        let network = self.lookup().await?;
        let allocated = self
            .client
            .list_allocated_ips(&self.vdc, self.network_type, &self.name)
            .await?;
        Ok(make_map(vec![
            ("allocated_ips", allocated.into()),
            ("resource", DynamicValue::List(network.items())),
        ]))
    }
}
