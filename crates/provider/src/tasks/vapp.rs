//! vApp tasks

use tracing::debug;
use vcloud_common::{PowerAction, Result};

use super::{enrich, with_config, TaskCall, TaskOutcome, REL_VAPP_NETWORK};
use crate::classifier;
use crate::resources::{PowerControl, VApp};

pub async fn create_vapp(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut config = call.primary().resource_config.clone();
    enrich(
        &mut config,
        "network",
        call.instance().related_resource_id(REL_VAPP_NETWORK),
    );
    call.stage_config(&config);

    let mut vapp = VApp::from_descriptor(&with_config(call.primary(), config));
    if call.external {
        vapp.lookup().await?;
        return Ok(TaskOutcome::adopted(vapp));
    }
    let task = vapp.create().await?;
    Ok(TaskOutcome::pending(vapp, task))
}

pub async fn start_vapp(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut vapp = VApp::from_descriptor(call.primary());
    let task = vapp.power(PowerAction::PowerOn).await?;
    Ok(TaskOutcome::pending(vapp, task))
}

pub async fn stop_vapp(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut vapp = VApp::from_descriptor(call.primary());
    match vapp.power(PowerAction::Undeploy).await {
        Ok(task) => Ok(TaskOutcome::pending(vapp, task)),
        Err(err) if classifier::cannot_power_off(&err) => {
            debug!("vApp {} is already stopped: {}", call.primary().resource_id, err);
            Ok(TaskOutcome::done(vapp))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn delete_vapp(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut vapp = VApp::from_descriptor(call.primary());
    if call.external {
        return Ok(TaskOutcome::adopted(vapp));
    }
    let task = vapp.delete().await?;
    Ok(TaskOutcome::pending(vapp, task))
}
