//! NIC tasks
//!
//! The NIC node only holds a NIC definition. It becomes a remote NIC when the
//! relationship to its VM is configured, and stops being one on unlink.

use serde_json::{json, Value};
use tracing::{debug, info};
use vcloud_common::{DynamicValue, Element, ProviderError, Result};

use super::vm::vm_adapter;
use super::{enrich, with_config, TaskCall, TaskOutcome, REL_NIC_NETWORK};
use crate::resources::{Nic, Resource, Vm};
use crate::state;

fn nic_index(nic: &Element) -> Option<i64> {
    nic.child_text("index")?.parse().ok()
}

fn recorded_index(call: &TaskCall<'_>) -> Option<i64> {
    call.bag().get(state::NIC_INDEX).and_then(Value::as_i64)
}

pub async fn create_nic(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut config = call.primary().resource_config.clone();
    enrich(
        &mut config,
        "network_name",
        call.instance().related_resource_id(REL_NIC_NETWORK),
    );
    call.stage_config(&config);

    let nic = Nic::from_descriptor(&with_config(call.primary(), config));
    if call.external {
        return Ok(TaskOutcome::adopted(nic));
    }
    Ok(TaskOutcome::done(nic))
}

pub async fn delete_nic(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let nic = Nic::from_descriptor(call.primary()).with_index(recorded_index(call));
    if call.external {
        return Ok(TaskOutcome::adopted(nic));
    }
    Ok(TaskOutcome::done(nic))
}

fn prior_indexes(call: &TaskCall<'_>) -> Option<Vec<i64>> {
    call.bag()
        .get(state::NIC_PRIOR_INDEXES)
        .and_then(Value::as_array)
        .map(|indexes| indexes.iter().filter_map(Value::as_i64).collect())
}

/// First NIC whose index is not among `known`.
fn added_nic(nics: Vec<Element>, known: &[i64]) -> Option<Element> {
    nics.into_iter()
        .find(|nic| nic_index(nic).is_some_and(|index| !known.contains(&index)))
}

/// Add the NIC and find it on the VM. The indexes the VM had before are
/// persisted first, so a retry can tell the new NIC apart.
async fn plug(call: &TaskCall<'_>, vm: &mut Vm, nic: &mut Nic, before: &[Element]) -> Result<Element> {
    let known: Vec<i64> = before.iter().filter_map(nic_index).collect();
    call.stage(state::NIC_PRIOR_INDEXES, json!(known));

    let task = vm.add_nic(&nic.definition()).await?;
    nic.record_task("update", &task);
    call.settle(vm.client(), &task).await?;
    added_nic(vm.nics().await?, &known).ok_or_else(|| {
        ProviderError::InvalidResponse(format!(
            "NIC {} did not appear on VM {}",
            nic.name(),
            vm.name()
        ))
        .into()
    })
}

/// Plug the NIC into the VM on the other end of the relationship.
pub async fn configure_nic(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut nic = Nic::from_descriptor(call.primary());
    if let Some(index) = recorded_index(call) {
        debug!("NIC {} is already plugged in at index {}", nic.name(), index);
        return Ok(TaskOutcome::done(nic.with_index(Some(index))));
    }

    let mut vm = vm_adapter(call.secondary()?, call.secondary_bag());
    let before = vm.nics().await?;

    // An earlier attempt may have added the NIC and failed while waiting
    let leftover = prior_indexes(call).and_then(|known| added_nic(before.clone(), &known));
    let added = match leftover {
        Some(existing) => {
            debug!("Reusing NIC added to VM {} by an earlier attempt", vm.name());
            existing
        }
        None => plug(call, &mut vm, &mut nic, &before).await?,
    };

    let index = nic_index(&added).ok_or_else(|| {
        ProviderError::InvalidResponse(format!("NIC on VM {} has no index", vm.name()))
    })?;
    info!("NIC {} plugged into VM {} at index {}", nic.name(), vm.name(), index);
    call.stage(state::NIC_INDEX, Value::from(index));
    call.stage(state::NIC_PRIOR_INDEXES, Value::Null);
    call.stage(state::PORT, DynamicValue::from(added).to_plain());
    Ok(TaskOutcome::done(nic.with_index(Some(index))))
}

/// Unplug the NIC from its VM.
pub async fn unlink_nic(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut nic = Nic::from_descriptor(call.primary());
    let Some(index) = recorded_index(call) else {
        debug!("NIC {} was never plugged in", nic.name());
        return Ok(TaskOutcome::done(nic));
    };

    let mut vm = vm_adapter(call.secondary()?, call.secondary_bag());
    let task = vm.delete_nic(index).await?;
    nic.record_task("delete", &task);
    call.stage(state::NIC_INDEX, Value::Null);
    call.stage(state::PORT, Value::Null);
    Ok(TaskOutcome::pending(nic, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_index() {
        let nic = Element::new("NetworkConnection").with_child(Element::int("index", 2));
        assert_eq!(nic_index(&nic), Some(2));
        assert_eq!(nic_index(&Element::new("NetworkConnection")), None);
    }

    #[test]
    fn test_added_nic_skips_known_indexes() {
        let nic = |index: i64, network: &str| {
            Element::new("NetworkConnection")
                .with_child(Element::int("index", index))
                .with_child(Element::string("network", network))
        };
        let nics = vec![nic(0, "net1"), nic(1, "net1")];

        let added = added_nic(nics.clone(), &[0]).unwrap();
        assert_eq!(nic_index(&added), Some(1));
        assert!(added_nic(nics, &[0, 1]).is_none());
    }
}
