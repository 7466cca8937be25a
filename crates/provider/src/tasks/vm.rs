//! VM tasks

use serde_json::{json, Map, Value};
use tracing::{debug, info};
use vcloud_common::{PowerAction, ProviderError, Result, RuntimeProperties};

use super::{enrich, with_config, TaskCall, TaskOutcome, REL_VM_NETWORK, REL_VM_VAPP};
use crate::classifier;
use crate::resolver::ResourceDescriptor;
use crate::resources::vm::nic_addresses;
use crate::resources::{PowerControl, Resource, Vm};
use crate::state;

/// vApp name a VM's bag remembers from its create
pub(crate) fn remembered_vapp(bag: Option<&RuntimeProperties>) -> Option<String> {
    let bag = bag?;
    state::get_string(bag, state::VAPP).or_else(|| state::get_data_string(bag, state::VAPP))
}

/// Name of the vApp a VM lives in: remembered by an earlier operation,
/// configured, or else named after the VM itself.
pub(crate) fn vapp_name(descriptor: &ResourceDescriptor, bag: Option<&RuntimeProperties>) -> String {
    remembered_vapp(bag)
        .or_else(|| {
            descriptor
                .resource_config
                .get(state::VAPP)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| descriptor.resource_id.clone())
}

/// Adapter for a VM described by `descriptor`, whose bag is `bag`
pub(crate) fn vm_adapter(descriptor: &ResourceDescriptor, bag: Option<&RuntimeProperties>) -> Vm {
    Vm::from_descriptor(descriptor, vapp_name(descriptor, bag))
}

fn vapp_config(config: &Map<String, Value>) -> Map<String, Value> {
    config
        .get("vapp_config")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn is_gone(err: &ProviderError) -> bool {
    matches!(err, ProviderError::EntityNotFound(_) | ProviderError::NotFound(_))
}

pub async fn create_vm(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut config = call.primary().resource_config.clone();
    enrich(
        &mut config,
        state::VAPP,
        call.instance().related_resource_id(REL_VM_VAPP),
    );
    enrich(
        &mut config,
        state::NETWORK,
        call.instance().related_resource_id(REL_VM_NETWORK),
    );
    call.stage_config(&config);

    let descriptor = with_config(call.primary(), config);
    let mut vm = vm_adapter(&descriptor, Some(call.bag()));
    call.stage(state::VAPP, Value::String(vm.vapp_name().to_string()));
    call.stage(
        state::SERVER,
        json!({"name": descriptor.resource_id, "vapp": vm.vapp_name()}),
    );

    if call.external {
        vm.lookup().await?;
        return Ok(TaskOutcome::adopted(vm));
    }

    let vapp_config = vapp_config(&descriptor.resource_config);
    match vm.vapp(&vapp_config).lookup().await {
        Ok(_) => {
            let task = vm.create().await?;
            Ok(TaskOutcome::pending(vm, task))
        }
        Err(err) if is_gone(&err) => {
            info!(
                "vApp {} does not exist, instantiating it with VM {}",
                vm.vapp_name(),
                vm.name()
            );
            let task = vm.instantiate_vapp(&vapp_config).await?;
            call.stage(state::VM_CREATE_VAPP, Value::Bool(true));
            Ok(TaskOutcome::pending(vm, task))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn configure_vm(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let vm = vm_adapter(call.primary(), Some(call.bag()));
    let nics = vm.nics().await?;
    let (primary, all) = nic_addresses(&nics);
    if let Some(address) = primary.or_else(|| all.first().cloned()) {
        debug!("VM {} has address {}", vm.name(), address);
        for key in ["ip", "ip_address", "private_ip_address", "ipv4_address"] {
            call.stage(key, Value::String(address.clone()));
        }
    }
    call.stage("ip_addresses", json!(all));
    call.stage("ipv4_addresses", json!(all));

    if call.external {
        return Ok(TaskOutcome::adopted(vm));
    }
    Ok(TaskOutcome::done(vm))
}

pub async fn start_vm(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut vm = vm_adapter(call.primary(), Some(call.bag()));
    let task = vm.power(PowerAction::PowerOn).await?;
    Ok(TaskOutcome::pending(vm, task))
}

pub async fn stop_vm(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut vm = vm_adapter(call.primary(), Some(call.bag()));
    match vm.power(PowerAction::PowerOff).await {
        Ok(task) => Ok(TaskOutcome::pending(vm, task)),
        Err(err) if classifier::cannot_power_off(&err) => {
            debug!("VM {} is already powered off: {}", vm.name(), err);
            Ok(TaskOutcome::done(vm))
        }
        Err(err) => Err(err.into()),
    }
}

/// Power the VM off and delete it. A VM that instantiated its own vApp takes
/// the vApp down with it.
pub async fn delete_vm(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut vm = vm_adapter(call.primary(), Some(call.bag()));
    if call.external {
        return Ok(TaskOutcome::adopted(vm));
    }
    let owns_vapp = state::get_flag(call.bag(), state::VM_CREATE_VAPP);

    match vm.power(PowerAction::PowerOff).await {
        Ok(task) => call.settle(vm.client(), &task).await?,
        Err(err) if classifier::cannot_power_off(&err) => {
            debug!("VM {} is already powered off: {}", vm.name(), err);
        }
        Err(err) if owns_vapp && is_gone(&err) => {
            debug!("VM {} is already gone: {}", vm.name(), err);
        }
        Err(err) => return Err(err.into()),
    }

    let task = match vm.delete().await {
        Ok(task) => Some(task),
        Err(err) if owns_vapp && is_gone(&err) => None,
        Err(err) => return Err(err.into()),
    };

    if !owns_vapp {
        return Ok(match task {
            Some(task) => TaskOutcome::pending(vm, task),
            None => TaskOutcome::done(vm),
        });
    }

    if let Some(task) = &task {
        call.settle(vm.client(), task).await?;
    }
    info!("Deleting vApp {} created by VM {}", vm.vapp_name(), vm.name());
    let mut vapp = vm.vapp(&Map::new());
    let vapp_task = vapp.delete().await?;
    Ok(TaskOutcome::pending(vm, vapp_task))
}
