//! Task functions
//!
//! One function per resource kind and verb. A task function only performs the
//! provider calls for its operation and reports what it produced; retry, adoption
//! and persistence decisions belong to the [`Engine`](crate::engine::Engine).

pub mod disk;
pub mod gateway;
pub mod media;
pub mod network;
pub mod nic;
pub mod vapp;
pub mod vm;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vcloud_common::{
    Element, Error, ProviderError, Result, ResourceKind, RuleFamily, RuntimeProperties, TaskStatus,
};

use crate::client::{extract_task, ProviderResult, VcdClient};
use crate::context::{InstanceContext, OperationContext};
use crate::resolver::{ResourceData, ResourceDescriptor};
use crate::resources::Resource;
use crate::state;

pub const REL_NETWORK_GATEWAY: &str = "cloudify.relationships.vcloud.network_connected_to_gateway";
pub const REL_VAPP_NETWORK: &str = "cloudify.relationships.vcloud.vapp_connected_to_network";
pub const REL_VM_VAPP: &str = "cloudify.relationships.vcloud.vm_contained_in_vapp";
pub const REL_VM_NETWORK: &str = "cloudify.relationships.vcloud.vm_connected_to_network";
pub const REL_NIC_NETWORK: &str = "cloudify.relationships.vcloud.nic_connected_to_network";

/// What a task function produced
pub enum TaskOutcome {
    /// A managed call went through; `task` is the raw answer to poll, if any
    Success {
        resource: Box<dyn Resource>,
        task: Option<Element>,
    },
    /// An existing resource was looked up and left untouched
    Adopted { resource: Box<dyn Resource> },
    /// Nothing to do
    NoOp,
}

impl TaskOutcome {
    pub fn done(resource: impl Resource + 'static) -> Self {
        TaskOutcome::Success {
            resource: Box::new(resource),
            task: None,
        }
    }

    pub fn pending(resource: impl Resource + 'static, task: Element) -> Self {
        TaskOutcome::Success {
            resource: Box::new(resource),
            task: Some(task),
        }
    }

    pub fn adopted(resource: impl Resource + 'static) -> Self {
        TaskOutcome::Adopted {
            resource: Box::new(resource),
        }
    }
}

impl std::fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Success { resource, task } => f
                .debug_struct("Success")
                .field("resource", &resource.name())
                .field("task", &task.as_ref().map(|t| t.items()))
                .finish(),
            TaskOutcome::Adopted { resource } => f
                .debug_struct("Adopted")
                .field("resource", &resource.name())
                .finish(),
            TaskOutcome::NoOp => write!(f, "NoOp"),
        }
    }
}

/// Inputs of one task function call.
///
/// The engine calls a task at most twice per invocation: once managed and,
/// when that produced nothing, once more with `external` set.
pub struct TaskCall<'a> {
    pub ctx: &'a OperationContext,
    pub data: &'a ResourceData,
    /// Look the resource up instead of mutating it
    pub external: bool,
    pub poll_timeout: Duration,
    staged: Mutex<RuntimeProperties>,
}

impl<'a> TaskCall<'a> {
    pub fn new(ctx: &'a OperationContext, data: &'a ResourceData, poll_timeout: Duration) -> Self {
        Self {
            ctx,
            data,
            external: data.primary.external,
            poll_timeout,
            staged: Mutex::new(Map::new()),
        }
    }

    pub fn verb(&self) -> &str {
        self.ctx.verb()
    }

    pub fn primary(&self) -> &ResourceDescriptor {
        &self.data.primary
    }

    /// The other end of a relationship operation.
    pub fn secondary(&self) -> Result<&ResourceDescriptor> {
        self.data.secondary.as_ref().ok_or_else(|| {
            Error::NonRecoverable(format!(
                "Operation {} on {} needs a relationship context.",
                self.ctx.operation, self.data.primary.resource_id
            ))
        })
    }

    pub fn instance(&self) -> &InstanceContext {
        self.ctx.primary()
    }

    /// Persisted bag of the primary instance, as of the start of the call
    pub fn bag(&self) -> &RuntimeProperties {
        &self.ctx.primary().runtime_properties
    }

    pub fn secondary_bag(&self) -> Option<&RuntimeProperties> {
        self.ctx.secondary().map(|other| &other.runtime_properties)
    }

    /// Queue a property for the primary bag. The engine persists staged
    /// properties before it polls.
    pub fn stage(&self, key: &str, value: Value) {
        self.staged.lock().insert(key.to_string(), value);
    }

    /// Stage an enriched configuration so that retries resolve it again.
    pub fn stage_config(&self, config: &Map<String, Value>) {
        self.stage(state::RESOURCE_CONFIG, Value::Object(config.clone()));
    }

    pub fn take_staged(&self) -> RuntimeProperties {
        std::mem::take(&mut *self.staged.lock())
    }

    /// Wait for an intermediate task before the next dependent call. A task
    /// still running at the deadline is reported as a busy entity.
    pub async fn settle(&self, client: &Arc<dyn VcdClient>, result: &Element) -> ProviderResult<()> {
        let Some(handle) = extract_task(result) else {
            return Ok(());
        };
        debug!("Waiting for intermediate task {} ({})", handle.id, handle.operation);
        match client.wait_for_task(&handle, self.poll_timeout).await? {
            TaskStatus::Success => Ok(()),
            status => Err(ProviderError::Sdk(format!(
                "Task {} is {}; {} is busy, cannot proceed with the operation.",
                handle.id, status, self.data.primary.resource_id
            ))),
        }
    }
}

/// A descriptor carrying a different configuration
pub(crate) fn with_config(
    descriptor: &ResourceDescriptor,
    config: Map<String, Value>,
) -> ResourceDescriptor {
    ResourceDescriptor {
        resource_config: config,
        ..descriptor.clone()
    }
}

/// Fill `key` from a relationship unless the configuration already has it.
pub(crate) fn enrich(config: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if config.contains_key(key) {
        return;
    }
    if let Some(value) = value {
        debug!("Using {} {} from relationship", key, value);
        config.insert(key.to_string(), Value::String(value));
    }
}

#[async_trait]
pub trait ResourceTask: Send + Sync {
    async fn execute(&self, call: &TaskCall<'_>) -> Result<TaskOutcome>;
}

/// Every operation this plugin exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateGateway,
    ConfigureGateway,
    DeleteGateway,
    CreateRules(RuleFamily),
    DeleteRules(RuleFamily),
    CreateNetwork,
    DeleteNetwork,
    CreateVApp,
    StartVApp,
    StopVApp,
    DeleteVApp,
    CreateVm,
    ConfigureVm,
    StartVm,
    StopVm,
    DeleteVm,
    CreateNic,
    DeleteNic,
    ConfigureNic,
    UnlinkNic,
    CreateDisk,
    ConfigureDisk,
    DeleteDisk,
    AttachDisk,
    DetachDisk,
    CreateMedia,
    DeleteMedia,
    AttachMedia,
    DetachMedia,
}

fn rule_family(kind: ResourceKind) -> Option<RuleFamily> {
    match kind {
        ResourceKind::FirewallRules => Some(RuleFamily::Firewall),
        ResourceKind::NatRules => Some(RuleFamily::Nat),
        ResourceKind::DhcpPools => Some(RuleFamily::DhcpPool),
        ResourceKind::StaticRoutes => Some(RuleFamily::StaticRoute),
        _ => None,
    }
}

impl Operation {
    /// The operation a kind runs for a verb, on a node instance or on a
    /// relationship.
    pub fn lookup(kind: ResourceKind, verb: &str, relationship: bool) -> Result<Self> {
        use ResourceKind as K;

        let operation = match (kind, relationship, verb) {
            (K::Gateway, false, "create") => Some(Operation::CreateGateway),
            (K::Gateway, false, "configure") => Some(Operation::ConfigureGateway),
            (K::Gateway, false, "delete") => Some(Operation::DeleteGateway),
            (K::FirewallRules | K::NatRules | K::DhcpPools | K::StaticRoutes, true, verb) => {
                match (rule_family(kind), verb) {
                    (Some(family), "create") => Some(Operation::CreateRules(family)),
                    (Some(family), "delete") => Some(Operation::DeleteRules(family)),
                    _ => None,
                }
            }
            (
                K::RoutedNetwork | K::IsolatedNetwork | K::DirectlyConnectedNetwork,
                false,
                "create",
            ) => Some(Operation::CreateNetwork),
            (
                K::RoutedNetwork | K::IsolatedNetwork | K::DirectlyConnectedNetwork,
                false,
                "delete",
            ) => Some(Operation::DeleteNetwork),
            (K::VApp, false, "create") => Some(Operation::CreateVApp),
            (K::VApp, false, "start") => Some(Operation::StartVApp),
            (K::VApp, false, "stop") => Some(Operation::StopVApp),
            (K::VApp, false, "delete") => Some(Operation::DeleteVApp),
            (K::Vm, false, "create") => Some(Operation::CreateVm),
            (K::Vm, false, "configure") => Some(Operation::ConfigureVm),
            (K::Vm, false, "start") => Some(Operation::StartVm),
            (K::Vm, false, "stop") => Some(Operation::StopVm),
            (K::Vm, false, "delete") => Some(Operation::DeleteVm),
            (K::Nic, false, "create") => Some(Operation::CreateNic),
            (K::Nic, false, "delete") => Some(Operation::DeleteNic),
            (K::Nic, true, "configure") => Some(Operation::ConfigureNic),
            (K::Nic, true, "unlink") => Some(Operation::UnlinkNic),
            (K::Disk, false, "create") => Some(Operation::CreateDisk),
            (K::Disk, false, "configure") => Some(Operation::ConfigureDisk),
            (K::Disk, false, "delete") => Some(Operation::DeleteDisk),
            (K::Disk, true, "attach") => Some(Operation::AttachDisk),
            (K::Disk, true, "detach") => Some(Operation::DetachDisk),
            (K::Media, false, "create") => Some(Operation::CreateMedia),
            (K::Media, false, "delete") => Some(Operation::DeleteMedia),
            (K::Media, true, "attach") => Some(Operation::AttachMedia),
            (K::Media, true, "detach") => Some(Operation::DetachMedia),
            _ => None,
        };

        operation.ok_or_else(|| {
            Error::NonRecoverable(format!(
                "Operation {} is not supported on {} {}.",
                verb,
                kind,
                if relationship { "relationships" } else { "nodes" }
            ))
        })
    }
}

#[async_trait]
impl ResourceTask for Operation {
    async fn execute(&self, call: &TaskCall<'_>) -> Result<TaskOutcome> {
        match *self {
            Operation::CreateGateway | Operation::ConfigureGateway => {
                gateway::configure_gateway(call).await
            }
            Operation::DeleteGateway => gateway::delete_gateway(call).await,
            Operation::CreateRules(family) => gateway::create_rules(call, family).await,
            Operation::DeleteRules(family) => gateway::delete_rules(call, family).await,
            Operation::CreateNetwork => network::create_network(call).await,
            Operation::DeleteNetwork => network::delete_network(call).await,
            Operation::CreateVApp => vapp::create_vapp(call).await,
            Operation::StartVApp => vapp::start_vapp(call).await,
            Operation::StopVApp => vapp::stop_vapp(call).await,
            Operation::DeleteVApp => vapp::delete_vapp(call).await,
            Operation::CreateVm => vm::create_vm(call).await,
            Operation::ConfigureVm => vm::configure_vm(call).await,
            Operation::StartVm => vm::start_vm(call).await,
            Operation::StopVm => vm::stop_vm(call).await,
            Operation::DeleteVm => vm::delete_vm(call).await,
            Operation::CreateNic => nic::create_nic(call).await,
            Operation::DeleteNic => nic::delete_nic(call).await,
            Operation::ConfigureNic => nic::configure_nic(call).await,
            Operation::UnlinkNic => nic::unlink_nic(call).await,
            Operation::CreateDisk => disk::create_disk(call).await,
            Operation::ConfigureDisk => disk::configure_disk(call).await,
            Operation::DeleteDisk => disk::delete_disk(call).await,
            Operation::AttachDisk => disk::attach_disk(call).await,
            Operation::DetachDisk => disk::detach_disk(call).await,
            Operation::CreateMedia => media::create_media(call).await,
            Operation::DeleteMedia => media::delete_media(call).await,
            Operation::AttachMedia => media::attach_media(call).await,
            Operation::DetachMedia => media::detach_media(call).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ResourceKind::Gateway, "create", false => Some(Operation::CreateGateway))]
    #[test_case(ResourceKind::NatRules, "create", true => Some(Operation::CreateRules(RuleFamily::Nat)))]
    #[test_case(ResourceKind::StaticRoutes, "delete", true => Some(Operation::DeleteRules(RuleFamily::StaticRoute)))]
    #[test_case(ResourceKind::IsolatedNetwork, "delete", false => Some(Operation::DeleteNetwork))]
    #[test_case(ResourceKind::Nic, "unlink", true => Some(Operation::UnlinkNic))]
    #[test_case(ResourceKind::Disk, "attach", true => Some(Operation::AttachDisk))]
    #[test_case(ResourceKind::Disk, "attach", false => None)]
    #[test_case(ResourceKind::Gateway, "start", false => None)]
    fn test_lookup(kind: ResourceKind, verb: &str, relationship: bool) -> Option<Operation> {
        Operation::lookup(kind, verb, relationship).ok()
    }

    #[test]
    fn test_unsupported_operation_is_fatal() {
        let err = Operation::lookup(ResourceKind::Media, "start", false).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Non-recoverable error: Operation start is not supported on Media nodes."
        );
    }

    #[test]
    fn test_enrich_keeps_declared_values() {
        let mut config = Map::new();
        enrich(&mut config, "network", Some("net1".into()));
        enrich(&mut config, "network", Some("net2".into()));
        enrich(&mut config, "vapp", None);
        assert_eq!(config.get("network"), Some(&Value::from("net1")));
        assert!(!config.contains_key("vapp"));
    }
}
