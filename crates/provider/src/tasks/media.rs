//! Catalog media tasks

use serde_json::Value;
use tracing::{info, warn};
use vcloud_common::{Error, Result};

use super::vm::{remembered_vapp, vm_adapter};
use super::{TaskCall, TaskOutcome};
use crate::resources::{IsoImage, Media, Resource};

const ISO: &str = "iso";

/// The `iso` node property, when it describes an image to build
fn iso_image(call: &TaskCall<'_>) -> Result<Option<IsoImage>> {
    match call.instance().node.properties.get(ISO) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => IsoImage::from_value(value).map(Some),
    }
}

/// Upload the ISO named by `file_name`, or one built from the `iso` property.
pub async fn create_media(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut media = Media::from_descriptor(call.primary());
    if call.external {
        media.lookup().await?;
        return Ok(TaskOutcome::adopted(media));
    }

    if let Some(image) = iso_image(call)? {
        let file = image.write_temp().await?;
        let path = file.path().to_string_lossy().into_owned();
        info!("Uploading generated ISO for media {}", media.name());
        media.upload(&path).await?;
        return Ok(TaskOutcome::done(media));
    }

    let file_name = media.file_name().map(str::to_string).ok_or_else(|| {
        Error::InvalidConfig(format!(
            "Media {} has neither an iso property nor a file_name to upload.",
            call.primary().resource_id
        ))
    })?;
    media.upload(&file_name).await?;
    Ok(TaskOutcome::done(media))
}

pub async fn delete_media(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let mut media = Media::from_descriptor(call.primary());
    if call.external {
        return Ok(TaskOutcome::adopted(media));
    }
    media.delete().await?;
    Ok(TaskOutcome::done(media))
}

pub async fn attach_media(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let media = Media::from_descriptor(call.primary());
    let mut vm = vm_adapter(call.secondary()?, call.secondary_bag());
    let href = media.href().await?;
    let task = vm.insert_media(&href).await?;
    Ok(TaskOutcome::pending(media, task))
}

pub async fn detach_media(call: &TaskCall<'_>) -> Result<TaskOutcome> {
    let media = Media::from_descriptor(call.primary());
    let vm_descriptor = call.secondary()?;
    if remembered_vapp(call.secondary_bag()).is_none() {
        warn!(
            "No vApp was found to eject media {} from VM {}.",
            call.primary().resource_id,
            vm_descriptor.resource_id
        );
        return Ok(TaskOutcome::done(media));
    }

    let mut vm = vm_adapter(vm_descriptor, call.secondary_bag());
    let id = media.id().await?;
    let task = vm.eject_media(&id).await?;
    Ok(TaskOutcome::pending(media, task))
}
