//! VM adapter

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::value::make_map;
use vcloud_common::{DynamicValue, Element, PowerAction};

use super::{config_without, record, PowerControl, Resource, VApp};
use crate::classifier;
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

pub struct Vm {
    name: String,
    vapp_name: String,
    vdc: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    tasks: TaskHistory,
}

impl Vm {
    pub fn new(
        name: impl Into<String>,
        vapp_name: impl Into<String>,
        client: Arc<dyn VcdClient>,
        vdc: impl Into<String>,
        config: &Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            vapp_name: vapp_name.into(),
            vdc: vdc.into(),
            client,
            config: config_without(config, &["name", "vapp", "vapp_config"]),
            tasks: TaskHistory::default(),
        }
    }

    pub fn from_descriptor(descriptor: &ResourceDescriptor, vapp_name: impl Into<String>) -> Self {
        Self {
            tasks: descriptor.tasks.clone(),
            ..Self::new(
                descriptor.resource_id.clone(),
                vapp_name,
                descriptor.client.clone(),
                descriptor.vdc.clone(),
                &descriptor.resource_config,
            )
        }
    }

    pub fn vapp_name(&self) -> &str {
        &self.vapp_name
    }

    /// Adapter for the containing vApp
    pub fn vapp(&self, vapp_config: &Map<String, Value>) -> VApp {
        VApp::new(
            self.vapp_name.clone(),
            self.client.clone(),
            self.vdc.clone(),
            vapp_config,
        )
    }

    pub async fn lookup(&self) -> ProviderResult<Element> {
        self.client
            .get_vm(&self.vdc, &self.vapp_name, &self.name)
            .await
    }

    /// Add the VM to its existing vApp; an existing VM of the same name is
    /// returned as is.
    pub async fn create(&mut self) -> ProviderResult<Element> {
        debug!("Adding VM {} to vApp {}", self.name, self.vapp_name);
        match self
            .client
            .add_vm(&self.vdc, &self.vapp_name, &self.name, &self.config)
            .await
        {
            Ok(task) => {
                record(&mut self.tasks, "create", &task);
                Ok(task)
            }
            Err(err) if classifier::already_exists(&err) => {
                debug!("VM {} already exists: {}", self.name, err);
                self.lookup().await
            }
            Err(err) => Err(err),
        }
    }

    /// Instantiate the containing vApp with this VM as its first member.
    pub async fn instantiate_vapp(
        &mut self,
        vapp_config: &Map<String, Value>,
    ) -> ProviderResult<Element> {
        let mut vapp = self.vapp(vapp_config);
        let result = vapp.instantiate(&self.name, &self.config).await?;
        record(&mut self.tasks, "create", &result);
        Ok(result)
    }

    pub async fn delete(&mut self) -> ProviderResult<Element> {
        debug!("Deleting VM {} from vApp {}", self.name, self.vapp_name);
        let task = self
            .client
            .delete_vm(&self.vdc, &self.vapp_name, &self.name)
            .await?;
        record(&mut self.tasks, "delete", &task);
        Ok(task)
    }

    pub async fn nics(&self) -> ProviderResult<Vec<Element>> {
        self.client
            .list_nics(&self.vdc, &self.vapp_name, &self.name)
            .await
    }

    pub async fn add_nic(&mut self, definition: &Map<String, Value>) -> ProviderResult<Element> {
        let task = self
            .client
            .add_nic(&self.vdc, &self.vapp_name, &self.name, definition)
            .await?;
        record(&mut self.tasks, "add_nic", &task);
        Ok(task)
    }

    pub async fn delete_nic(&mut self, index: i64) -> ProviderResult<Element> {
        let task = self
            .client
            .delete_nic(&self.vdc, &self.vapp_name, &self.name, index)
            .await?;
        record(&mut self.tasks, "remove_nic", &task);
        Ok(task)
    }

    pub async fn attach_disk(&mut self, disk_href: &str) -> ProviderResult<Element> {
        self.client
            .attach_disk(&self.vdc, &self.vapp_name, &self.name, disk_href)
            .await
    }

    pub async fn detach_disk(&mut self, disk_href: &str) -> ProviderResult<Element> {
        self.client
            .detach_disk(&self.vdc, &self.vapp_name, &self.name, disk_href)
            .await
    }

    pub async fn insert_media(&mut self, media_href: &str) -> ProviderResult<Element> {
        self.client
            .insert_media(&self.vdc, &self.vapp_name, &self.name, media_href)
            .await
    }

    pub async fn eject_media(&mut self, media_id: &str) -> ProviderResult<Element> {
        self.client
            .eject_media(&self.vdc, &self.vapp_name, &self.name, media_id)
            .await
    }
}

/// Addresses of a VM's NICs: the primary NIC's address, and all of them.
pub fn nic_addresses(nics: &[Element]) -> (Option<String>, Vec<String>) {
    let mut primary = None;
    let mut all = Vec::new();
    for nic in nics {
        let Some(address) = nic.child_text("ip_address") else {
            continue;
        };
        if nic.child_text("is_primary").as_deref() == Some("true") {
            primary = Some(address.clone());
        }
        if !all.contains(&address) {
            all.push(address);
        }
    }
    (primary, all)
}

#[async_trait]
impl PowerControl for Vm {
    async fn power(&mut self, action: PowerAction) -> ProviderResult<Element> {
        debug!("Requesting {} of VM {}", action, self.name);
        let task = self
            .client
            .power_vm(&self.vdc, &self.vapp_name, &self.name, action)
            .await?;
        record(&mut self.tasks, "update", &task);
        Ok(task)
    }
}

#[async_trait]
impl Resource for Vm {
    fn type_name(&self) -> &'static str {
        "vm"
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
        let vm = self.lookup().await?;
        let nics = self.nics().await?;
        Ok(make_map(vec![
            ("vapp", self.vapp_name.as_str().into()),
            ("href", vm.attr("href").into()),
            ("status", vm.child_text("status").into()),
            ("nics", nics.into()),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(index: i64, address: &str, primary: bool) -> Element {
        Element::new("NetworkConnection")
            .with_child(Element::int("index", index))
            .with_child(Element::string("ip_address", address))
            .with_child(Element::boolean("is_primary", primary))
    }

    #[test]
    fn test_nic_addresses() {
        let nics = vec![
            nic(0, "10.0.0.5", false),
            nic(1, "192.168.1.9", true),
            nic(2, "10.0.0.5", false),
        ];
        let (primary, all) = nic_addresses(&nics);
        assert_eq!(primary.as_deref(), Some("192.168.1.9"));
        assert_eq!(all, vec!["10.0.0.5".to_string(), "192.168.1.9".to_string()]);
        assert_eq!(nic_addresses(&[]), (None, vec![]));
    }
}
