//! Catalog ISO media adapter

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::value::make_map;
use vcloud_common::{DynamicValue, Element, ProviderError};

use super::Resource;
use crate::classifier;
use crate::client::{ProviderResult, VcdClient};
use crate::resolver::ResourceDescriptor;
use crate::state::TaskHistory;

const ISO_SUFFIX: &str = ".iso";

pub struct Media {
    name: String,
    client: Arc<dyn VcdClient>,
    config: Map<String, Value>,
    uploaded_bytes: Option<u64>,
    tasks: TaskHistory,
}

impl Media {
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        Self {
            name: iso_name(&descriptor.resource_id),
            client: descriptor.client.clone(),
            config: descriptor.resource_config.clone(),
            uploaded_bytes: None,
            tasks: descriptor.tasks.clone(),
        }
    }

    pub fn catalog_name(&self) -> &str {
        self.config
            .get("catalog_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.config.get("file_name").and_then(Value::as_str)
    }

    pub async fn lookup(&self) -> ProviderResult<Element> {
        self.client
            .get_catalog_item(self.catalog_name(), &self.name)
            .await
    }

    pub async fn href(&self) -> ProviderResult<String> {
        let item = self.lookup().await?;
        item.child("Entity")
            .and_then(|entity| entity.attr("href"))
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!("catalog item {} has no entity", self.name))
            })
    }

    /// Last segment of the href
    pub async fn id(&self) -> ProviderResult<String> {
        let href = self.href().await?;
        Ok(href.rsplit('/').next().unwrap_or(&href).to_string())
    }

    /// Upload the local ISO; media already in the catalog is left alone.
    pub async fn upload(&mut self, file_name: &str) -> ProviderResult<()> {
        debug!("Uploading {} to catalog {} as {}", file_name, self.catalog_name(), self.name);
        match self
            .client
            .upload_media(self.catalog_name(), &self.name, file_name)
            .await
        {
            Ok(bytes) => {
                self.uploaded_bytes = Some(bytes);
                Ok(())
            }
            Err(err) if classifier::already_exists(&err) => {
                debug!("Media {} already exists: {}", self.name, err);
                self.lookup().await.map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&mut self) -> ProviderResult<()> {
        debug!("Deleting media {} from catalog {}", self.name, self.catalog_name());
        self.client
            .delete_catalog_item(self.catalog_name(), &self.name)
            .await
    }
}

/// Catalog item name of an ISO, with its suffix
pub fn iso_name(name: &str) -> String {
    if name.ends_with(ISO_SUFFIX) {
        name.to_string()
    } else {
        format!("{}{}", name, ISO_SUFFIX)
    }
}

#[async_trait]
impl Resource for Media {
    fn type_name(&self) -> &'static str {
        "media"
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
        let href = self.href().await?;
        let id = href.rsplit('/').next().unwrap_or(&href).to_string();
        let mut entries = vec![
            ("name", DynamicValue::from(self.name.as_str())),
            ("catalog_name", DynamicValue::from(self.catalog_name())),
            ("id", DynamicValue::from(id)),
            ("href", DynamicValue::from(href)),
        ];
        if let Some(bytes) = self.uploaded_bytes {
            entries.push(("bytes", DynamicValue::from(bytes as i64)));
        }
        Ok(make_map(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_name() {
        assert_eq!(iso_name("cloud-init"), "cloud-init.iso");
        assert_eq!(iso_name("cloud-init.iso"), "cloud-init.iso");
    }
}
