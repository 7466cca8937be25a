//! vApp adapter

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::value::make_map;
use vcloud_common::{DynamicValue, Element, PowerAction};

use super::{config_without, record, PowerControl, Resource};
use crate::classifier;
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

pub struct VApp {
    name: String,
    vdc: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    tasks: TaskHistory,
}

impl VApp {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn VcdClient>,
        vdc: impl Into<String>,
        config: &Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            vdc: vdc.into(),
            client,
            config: config_without(config, &["name"]),
            tasks: TaskHistory::default(),
        }
    }

    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        Self {
            tasks: descriptor.tasks.clone(),
            ..Self::new(
                descriptor.resource_id.clone(),
                descriptor.client.clone(),
                descriptor.vdc.clone(),
                &descriptor.resource_config,
            )
        }
    }

    pub async fn lookup(&self) -> ProviderResult<Element> {
        self.client.get_vapp(&self.vdc, &self.name).await
    }

    /// Create an empty vApp; an existing one of the same name is returned.
    pub async fn create(&mut self) -> ProviderResult<Element> {
        debug!("Creating vApp {}", self.name);
        match self.client.create_vapp(&self.vdc, &self.name, &self.config).await {
            Ok(vapp) => {
                record(&mut self.tasks, "create", &vapp);
                Ok(vapp)
            }
            Err(err) if classifier::already_exists(&err) => {
                debug!("vApp {} already exists: {}", self.name, err);
                self.lookup().await
            }
            Err(err) => Err(err),
        }
    }

    /// Instantiate the vApp from its template together with its first VM.
    pub async fn instantiate(
        &mut self,
        vm_name: &str,
        vm_config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        let mut config = self.config.clone();
        for (key, value) in vm_config {
            config.entry(key.clone()).or_insert_with(|| value.clone());
        }
        debug!("Instantiating vApp {} with VM {}", self.name, vm_name);
        let vapp = self
            .client
            .instantiate_vapp(&self.vdc, &self.name, vm_name, &config)
            .await?;
        record(&mut self.tasks, "create", &vapp);
        Ok(vapp)
    }

    pub async fn delete(&mut self) -> ProviderResult<Element> {
        debug!("Deleting vApp {}", self.name);
        let task = self.client.delete_vapp(&self.vdc, &self.name).await?;
        record(&mut self.tasks, "delete", &task);
        Ok(task)
    }

    pub async fn connect_network(&mut self, network: &str) -> ProviderResult<Element> {
        let task = self
            .client
            .connect_vapp_network(&self.vdc, &self.name, network)
            .await?;
        record(&mut self.tasks, "add_network", &task);
        Ok(task)
    }

    pub async fn disconnect_network(&mut self, network: &str) -> ProviderResult<Element> {
        let task = self
            .client
            .disconnect_vapp_network(&self.vdc, &self.name, network)
            .await?;
        record(&mut self.tasks, "remove_network", &task);
        Ok(task)
    }
}

#[async_trait]
impl PowerControl for VApp {
    async fn power(&mut self, action: PowerAction) -> ProviderResult<Element> {
        debug!("Requesting {} of vApp {}", action, self.name);
        let task = self.client.power_vapp(&self.vdc, &self.name, action).await?;
        record(&mut self.tasks, "update", &task);
        Ok(task)
    }
}

#[async_trait]
impl Resource for VApp {
    fn type_name(&self) -> &'static str {
        "vapp"
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
        let vapp = self.lookup().await?;
        let vms: Vec<DynamicValue> = vapp
            .children_named("Vm")
            .filter_map(|vm| vm.attr("name"))
            .map(DynamicValue::from)
            .collect();
        Ok(make_map(vec![
            ("href", vapp.attr("href").into()),
            ("status", vapp.attr("status").into()),
            ("lease", vapp.child("LeaseSettingsSection").cloned().into()),
            ("networks", DynamicValue::from(
                vapp.children_named("NetworkConfig").cloned().collect::<Vec<_>>(),
            )),
            ("vms", DynamicValue::List(vms)),
        ]))
    }
}
