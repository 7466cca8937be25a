//! Remote cloud-directory client contract
//!
//! Every provider primitive the resource adapters need, expressed as one async
//! trait. Mutating calls answer with a `Task` element, or with an entity that
//! carries its tasks under a `Tasks` child; reads answer with plain elements.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use vcloud_common::{
    Element, NetworkType, PowerAction, ProviderError, Result, RuleFamily, TaskStatus,
};

use crate::config::ClientConfig;

/// Result of a single provider call
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Opaque reference to an in-flight provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: String,
    pub href: String,
    pub operation: String,
    pub status: TaskStatus,
}

impl TaskHandle {
    /// Read a handle from a `Task` element.
    pub fn from_element(element: &Element) -> Option<Self> {
        if element.tag != "Task" {
            return None;
        }
        let id = element.attr("id")?.to_string();
        Some(Self {
            href: element.attr("href").unwrap_or_default().to_string(),
            operation: element.attr("operationName").unwrap_or_default().to_string(),
            status: element
                .attr("status")
                .and_then(TaskStatus::parse)
                .unwrap_or_default(),
            id,
        })
    }
}

/// Pull the task out of a mutating call's answer.
///
/// A bare `Task` passes through; an entity is unwrapped through its
/// `Tasks/Task` child. Anything else carries no task.
pub fn extract_task(result: &Element) -> Option<TaskHandle> {
    if result.tag == "Task" {
        return TaskHandle::from_element(result);
    }
    result
        .child("Tasks")
        .and_then(|tasks| tasks.child("Task"))
        .and_then(TaskHandle::from_element)
}

/// Provider primitives used by the resource adapters
#[async_trait]
pub trait VcdClient: Send + Sync {
    // Org VDC networks

    async fn create_network(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    async fn get_network(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
    ) -> ProviderResult<Element>;

    async fn list_allocated_ips(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
    ) -> ProviderResult<Vec<Element>>;

    async fn delete_network(
        &self,
        vdc: &str,
        network_type: NetworkType,
        name: &str,
    ) -> ProviderResult<Element>;

    // Edge gateways

    async fn get_gateway(&self, vdc: &str, name: &str) -> ProviderResult<Element>;

    async fn list_gateway_rules(
        &self,
        vdc: &str,
        gateway: &str,
        family: RuleFamily,
    ) -> ProviderResult<Vec<Element>>;

    /// Add one rule. A rule identical to an existing one is rejected with a
    /// bad request.
    async fn add_gateway_rule(
        &self,
        vdc: &str,
        gateway: &str,
        family: RuleFamily,
        definition: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    async fn delete_gateway_rule(
        &self,
        vdc: &str,
        gateway: &str,
        family: RuleFamily,
        rule_id: &str,
    ) -> ProviderResult<()>;

    // vApps

    async fn create_vapp(
        &self,
        vdc: &str,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    /// Instantiate a vApp from a template, creating its first VM.
    async fn instantiate_vapp(
        &self,
        vdc: &str,
        name: &str,
        vm_name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    async fn get_vapp(&self, vdc: &str, name: &str) -> ProviderResult<Element>;

    async fn delete_vapp(&self, vdc: &str, name: &str) -> ProviderResult<Element>;

    async fn power_vapp(
        &self,
        vdc: &str,
        name: &str,
        action: PowerAction,
    ) -> ProviderResult<Element>;

    async fn connect_vapp_network(
        &self,
        vdc: &str,
        vapp: &str,
        network: &str,
    ) -> ProviderResult<Element>;

    async fn disconnect_vapp_network(
        &self,
        vdc: &str,
        vapp: &str,
        network: &str,
    ) -> ProviderResult<Element>;

    // VMs

    async fn add_vm(
        &self,
        vdc: &str,
        vapp: &str,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    async fn get_vm(&self, vdc: &str, vapp: &str, name: &str) -> ProviderResult<Element>;

    async fn delete_vm(&self, vdc: &str, vapp: &str, name: &str) -> ProviderResult<Element>;

    async fn power_vm(
        &self,
        vdc: &str,
        vapp: &str,
        name: &str,
        action: PowerAction,
    ) -> ProviderResult<Element>;

    async fn list_nics(&self, vdc: &str, vapp: &str, vm: &str) -> ProviderResult<Vec<Element>>;

    async fn add_nic(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        definition: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    async fn delete_nic(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        index: i64,
    ) -> ProviderResult<Element>;

    async fn attach_disk(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        disk_href: &str,
    ) -> ProviderResult<Element>;

    async fn detach_disk(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        disk_href: &str,
    ) -> ProviderResult<Element>;

    async fn insert_media(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        media_href: &str,
    ) -> ProviderResult<Element>;

    async fn eject_media(
        &self,
        vdc: &str,
        vapp: &str,
        vm: &str,
        media_id: &str,
    ) -> ProviderResult<Element>;

    // Independent disks

    async fn create_disk(
        &self,
        vdc: &str,
        name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    /// Look a disk up by id, or by name when no id is known.
    async fn get_disk(&self, vdc: &str, id_or_name: &str) -> ProviderResult<Element>;

    async fn delete_disk(&self, vdc: &str, id_or_name: &str) -> ProviderResult<Element>;

    async fn update_disk(
        &self,
        vdc: &str,
        id_or_name: &str,
        config: &Map<String, Value>,
    ) -> ProviderResult<Element>;

    // Catalog media

    /// Upload a local ISO into a catalog, returning the bytes transferred.
    async fn upload_media(
        &self,
        catalog: &str,
        item_name: &str,
        file_name: &str,
    ) -> ProviderResult<u64>;

    async fn get_catalog_item(&self, catalog: &str, item_name: &str) -> ProviderResult<Element>;

    async fn delete_catalog_item(&self, catalog: &str, item_name: &str) -> ProviderResult<()>;

    // Tasks

    /// Wait up to `timeout` for a task to reach a terminal status. A task that
    /// ends in error is reported as `ProviderError::TaskFailed`.
    async fn wait_for_task(
        &self,
        task: &TaskHandle,
        timeout: Duration,
    ) -> ProviderResult<TaskStatus>;
}

/// Builds a client for one side of an operation.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ClientConfig) -> Result<Arc<dyn VcdClient>>;
}

/// Connector that hands every caller the same client
#[derive(Clone)]
pub struct SharedConnector {
    client: Arc<dyn VcdClient>,
}

impl SharedConnector {
    pub fn new(client: Arc<dyn VcdClient>) -> Self {
        Self { client }
    }
}

impl Connector for SharedConnector {
    fn connect(&self, config: &ClientConfig) -> Result<Arc<dyn VcdClient>> {
        tracing::debug!("Connecting to {} as {}@{}", config.uri_or_default(), config.user, config.org);
        Ok(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: &str) -> Element {
        Element::new("Task")
            .with_attr("id", id)
            .with_attr("href", format!("https://vcd/api/task/{}", id))
            .with_attr("operationName", "vdcCreateVapp")
            .with_attr("status", status)
    }

    #[test]
    fn test_bare_task_passes_through() {
        let handle = extract_task(&task("t1", "running")).unwrap();
        assert_eq!(handle.id, "t1");
        assert_eq!(handle.status, TaskStatus::Running);
    }

    #[test]
    fn test_entity_task_is_unwrapped() {
        let vapp = Element::new("VApp")
            .with_attr("name", "web")
            .with_child(Element::new("Tasks").with_child(task("t2", "queued")));
        let handle = extract_task(&vapp).unwrap();
        assert_eq!(handle.id, "t2");
        assert_eq!(handle.operation, "vdcCreateVapp");
    }

    #[test]
    fn test_plain_entity_has_no_task() {
        let gateway = Element::new("EdgeGateway").with_attr("name", "edge1");
        assert!(extract_task(&gateway).is_none());
    }
}
