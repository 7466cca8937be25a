//! Independent disk tasks

use tracing::warn;
use vcloud_common::Result;

use super::vm::{remembered_vapp, vm_adapter};
use super::{TaskCall, TaskOutcome};
use crate::resources::Disk;

pub async fn create_disk(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut disk = Disk::from_descriptor(call.primary());
    if call.external {
        disk.lookup().await?;
        return Ok(TaskOutcome::adopted(disk));
    }
    let task = disk.create().await?;
    Ok(TaskOutcome::pending(disk, task))
}

pub async fn configure_disk(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut disk = Disk::from_descriptor(call.primary());
    if call.external {
        disk.lookup().await?;
        return Ok(TaskOutcome::adopted(disk));
    }
    let task = disk.update().await?;
    Ok(TaskOutcome::pending(disk, task))
}

pub async fn delete_disk(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut disk = Disk::from_descriptor(call.primary());
    if call.external {
        return Ok(TaskOutcome::adopted(disk));
    }
    let task = disk.delete().await?;
    Ok(TaskOutcome::pending(disk, task))
}

pub async fn attach_disk(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut disk = Disk::from_descriptor(call.primary());
    let mut vm = vm_adapter(call.secondary()?, call.secondary_bag());
    let href = disk.href().await?;
    let task = vm.attach_disk(&href).await?;
    Ok(TaskOutcome::pending(disk, task))
}

pub async fn detach_disk(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut disk = Disk::from_descriptor(call.primary());
    let vm_descriptor = call.secondary()?;
    if remembered_vapp(call.secondary_bag()).is_none() {
        warn!(
            "No vApp was found to detach disk {} from VM {}.",
            call.primary().resource_id,
            vm_descriptor.resource_id
        );
        return Ok(TaskOutcome::done(disk));
    }

    let mut vm = vm_adapter(vm_descriptor, call.secondary_bag());
    let href = disk.href().await?;
    let task = vm.detach_disk(&href).await?;
    Ok(TaskOutcome::pending(disk, task))
}
