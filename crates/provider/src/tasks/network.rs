//! Org VDC network tasks

use serde_json::Value;
use vcloud_common::{AdapterKind, Error, NetworkType, Result};

use super::{enrich, with_config, TaskCall, TaskOutcome, REL_NETWORK_GATEWAY};
use crate::resolver::ResourceDescriptor;
use crate::resources::Network;
use crate::state;

fn network_type(descriptor: &ResourceDescriptor) -> Result<NetworkType> {
    match descriptor.adapter {
        AdapterKind::Network(network_type) => Ok(network_type),
        other => Err(Error::NonRecoverable(format!(
            "{} {} is not a network.",
            other, descriptor.resource_id
        ))),
    }
}

pub async fn create_network(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let network_type = network_type(call.primary())?;
    let mut config = call.primary().resource_config.clone();
    if network_type == NetworkType::Routed {
        enrich(
            &mut config,
            "gateway_name",
            call.instance().related_resource_id(REL_NETWORK_GATEWAY),
        );
    }
    call.stage_config(&config);

    let mut network = Network::from_descriptor(&with_config(call.primary(), config), network_type);
    call.stage(state::NETWORK, Value::String(call.primary().resource_id.clone()));
    if call.external {
        network.lookup().await?;
        return Ok(TaskOutcome::adopted(network));
    }
    let task = network.create().await?;
    Ok(TaskOutcome::pending(network, task))
}

pub async fn delete_network(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut network = Network::from_descriptor(call.primary(), network_type(call.primary())?);
    if call.external {
        return Ok(TaskOutcome::adopted(network));
    }
    let task = network.delete().await?;
    Ok(TaskOutcome::pending(network, task))
}
