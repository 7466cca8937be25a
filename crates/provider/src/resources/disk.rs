//! Independent disk adapter

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::value::make_map;
use vcloud_common::{DynamicValue, Element};

use super::{config_without, record, Resource};
use crate::classifier;
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

pub struct Disk {
    name: String,
    vdc: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    id: Option<String>,
    href: Option<String>,
    tasks: TaskHistory,
}

impl Disk {
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        let tasks = descriptor.tasks.clone();
        // The first create task snapshot carries the disk's identifiers
        let id = tasks.identifier("create", "owner_id");
        let href = tasks.identifier("create", "owner_href");
        Self {
            name: descriptor.resource_id.clone(),
            vdc: descriptor.vdc.clone(),
            client: descriptor.client.clone(),
            config: config_without(&descriptor.resource_config, &["name"]),
            id,
            href,
            tasks,
        }
    }

    fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub async fn lookup(&mut self) -> ProviderResult<Element> {
        let disk = self.client.get_disk(&self.vdc, self.key()).await?;
        self.remember(&disk);
        Ok(disk)
    }

    fn remember(&mut self, disk: &Element) {
        if let Some(id) = disk.attr("id") {
            self.id = Some(id.to_string());
        }
        if let Some(href) = disk.attr("href") {
            self.href = Some(href.to_string());
        }
    }

    /// Disk href, looking the disk up when it is not known yet.
    pub async fn href(&mut self) -> ProviderResult<String> {
        if let Some(href) = &self.href {
            return Ok(href.clone());
        }
        let disk = self.lookup().await?;
        disk.attr("href")
            .map(str::to_string)
            .ok_or_else(|| vcloud_common::ProviderError::InvalidResponse(format!(
                "disk {} has no href",
                self.name
            )))
    }

    /// Create the disk; an existing disk of the same name is returned.
    pub async fn create(&mut self) -> ProviderResult<Element> {
        debug!("Creating disk {}", self.name);
        match self.client.create_disk(&self.vdc, &self.name, &self.config).await {
            Ok(disk) => {
                self.remember(&disk);
                record(&mut self.tasks, "create", &disk);
                Ok(disk)
            }
            Err(err) if classifier::already_exists(&err) => {
                debug!("Disk {} already exists: {}", self.name, err);
                self.lookup().await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&mut self) -> ProviderResult<Element> {
        debug!("Deleting disk {}", self.name);
        let key = self.key().to_string();
        let task = self.client.delete_disk(&self.vdc, &key).await?;
        record(&mut self.tasks, "delete", &task);
        Ok(task)
    }

    pub async fn update(&mut self) -> ProviderResult<Element> {
        debug!("Updating disk {}", self.name);
        let key = self.key().to_string();
        let task = self.client.update_disk(&self.vdc, &key, &self.config).await?;
        record(&mut self.tasks, "update", &task);
        Ok(task)
    }
}

#[async_trait]
impl Resource for Disk {
    fn type_name(&self) -> &'static str {
        "disk"
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
        let disk = self.client.get_disk(&self.vdc, self.key()).await?;
        let leaf = |tag: &str| DynamicValue::from(disk.child(tag).cloned());
        Ok(make_map(vec![
            ("id", disk.attr("id").into()),
            ("href", disk.attr("href").into()),
            ("size", leaf("size")),
            ("status", disk.attr("status").into()),
            ("iops", leaf("iops")),
            ("busSubType", leaf("busSubType")),
            ("busType", leaf("busType")),
        ]))
    }
}
