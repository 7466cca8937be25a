//! Resource Resolver
//!
//! Turns an operation context into one descriptor per participant: the
//! primary (the node instance, or the relationship's self side) and, for
//! relationship operations, the secondary.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use vcloud_common::{AdapterKind, Error, ResourceKind, Result};

use crate::client::{Connector, VcdClient};
use crate::config::ClientConfig;
use crate::context::{InstanceContext, OperationContext};
use crate::state::{self, TaskHistory};

/// Everything an operation needs to know about one participant
#[derive(Clone)]
pub struct ResourceDescriptor {
    pub external: bool,
    pub resource_id: String,
    pub instance_id: String,
    pub client: Arc<dyn VcdClient>,
    pub client_config: ClientConfig,
    pub vdc: String,
    pub resource_config: Map<String, Value>,
    /// Node kind of this participant, when it is one this plugin knows
    pub kind: Option<ResourceKind>,
    pub adapter: AdapterKind,
    pub tasks: TaskHistory,
}

impl std::fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("external", &self.external)
            .field("resource_id", &self.resource_id)
            .field("instance_id", &self.instance_id)
            .field("vdc", &self.vdc)
            .field("adapter", &self.adapter)
            .field("resource_config", &self.resource_config)
            .finish()
    }
}

/// Resolved participants of one operation
#[derive(Debug, Clone)]
pub struct ResourceData {
    /// Node kind of the primary participant
    pub kind: ResourceKind,
    pub primary: ResourceDescriptor,
    pub secondary: Option<ResourceDescriptor>,
}

/// Declared external, or a plain retry of an earlier attempt that did not
/// fail transiently.
pub fn is_external_resource(
    node_properties: &Map<String, Value>,
    runtime_properties: &Map<String, Value>,
    retry_number: u32,
) -> bool {
    let declared = node_properties
        .get(state::USE_EXTERNAL_RESOURCE)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if declared {
        return true;
    }
    retry_number > 0 && !state::get_flag(runtime_properties, state::RETRY_BAD_REQUEST)
}

/// Persisted id, then the declared one, then the instance id.
pub fn resource_id(instance: &InstanceContext) -> String {
    state::get_string(&instance.runtime_properties, state::RESOURCE_ID)
        .or_else(|| state::get_string(&instance.node.properties, state::RESOURCE_ID))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| instance.instance_id.clone())
}

/// Persisted configuration wins over the declared one, so that values
/// enriched by an earlier attempt survive a retry.
pub fn resource_config(instance: &InstanceContext) -> Map<String, Value> {
    instance
        .runtime_properties
        .get(state::RESOURCE_CONFIG)
        .or_else(|| instance.node.properties.get(state::RESOURCE_CONFIG))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// The most specific kind in the primary's type hierarchy.
pub fn resource_kind(instance: &InstanceContext) -> Result<ResourceKind> {
    ResourceKind::from_type_hierarchy(&instance.node.type_hierarchy).ok_or_else(|| {
        let known: Vec<&str> = ResourceKind::ALL.iter().map(|k| k.type_label()).collect();
        Error::NonRecoverable(format!(
            "A resource type matching node hierarchy {:?} not found. \
             Use one of {:?}, or derive type from those types.",
            instance.node.type_hierarchy, known
        ))
    })
}

fn describe(
    instance: &InstanceContext,
    retry_number: u32,
    adapter: AdapterKind,
    connector: &dyn Connector,
) -> Result<ResourceDescriptor> {
    let client_config = ClientConfig::from_properties(&instance.node.properties)?;
    let client = connector.connect(&client_config)?;
    Ok(ResourceDescriptor {
        external: is_external_resource(
            &instance.node.properties,
            &instance.runtime_properties,
            retry_number,
        ),
        resource_id: resource_id(instance),
        instance_id: instance.instance_id.clone(),
        vdc: client_config.vdc.clone().unwrap_or_default(),
        client,
        client_config,
        resource_config: resource_config(instance),
        kind: ResourceKind::from_type_hierarchy(&instance.node.type_hierarchy),
        adapter,
        tasks: TaskHistory::from_persisted(instance.runtime_properties.get(state::TASKS)),
    })
}

/// Resolve the primary and, for relationships, the secondary descriptor.
pub fn resolve(ctx: &OperationContext, connector: &dyn Connector) -> Result<ResourceData> {
    let primary_ctx = ctx.primary();
    let kind = resource_kind(primary_ctx)?;
    let (primary_adapter, secondary_adapter) = kind.adapters();

    let primary = describe(primary_ctx, ctx.retry_number, primary_adapter, connector)?;
    let secondary = ctx
        .secondary()
        .map(|other| describe(other, ctx.retry_number, secondary_adapter, connector))
        .transpose()?;

    debug!(
        "Resolved {} {} (external: {}){}",
        kind,
        primary.resource_id,
        primary.external,
        secondary
            .as_ref()
            .map(|s| format!(" with {} {}", s.adapter, s.resource_id))
            .unwrap_or_default()
    );

    Ok(ResourceData {
        kind,
        primary,
        secondary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SharedConnector;
    use crate::context::{NodeContext, RelationshipSide};
    use crate::simulator::InMemoryCloud;
    use serde_json::json;

    fn connector() -> SharedConnector {
        SharedConnector::new(Arc::new(InMemoryCloud::new()))
    }

    fn instance(id: &str, type_label: &str, properties: Value, runtime: Value) -> InstanceContext {
        InstanceContext {
            node: NodeContext {
                id: id.to_string(),
                type_hierarchy: vec![type_label.to_string(), "cloudify.nodes.Root".to_string()],
                properties: properties.as_object().cloned().unwrap(),
            },
            instance_id: format!("{}_a1b2c3", id),
            runtime_properties: runtime.as_object().cloned().unwrap(),
            relationships: vec![],
        }
    }

    fn client_config() -> Value {
        json!({"user": "u", "password": "p", "org": "acme", "vdc": "vdc1"})
    }

    #[test]
    fn test_external_inference() {
        let declared = json!({"use_external_resource": true}).as_object().cloned().unwrap();
        let none = Map::new();
        let sticky = json!({"__RETRY_BAD_REQUEST": true}).as_object().cloned().unwrap();

        assert!(is_external_resource(&declared, &none, 0));
        assert!(!is_external_resource(&none, &none, 0));
        assert!(is_external_resource(&none, &none, 1));
        assert!(!is_external_resource(&none, &sticky, 1));
        assert!(is_external_resource(&declared, &sticky, 1));
    }

    #[test]
    fn test_id_and_config_priority() {
        let fresh = instance(
            "net",
            "cloudify.nodes.vcloud.RoutedVDCNetwork",
            json!({"resource_id": "declared", "resource_config": {"a": 1}}),
            json!({}),
        );
        assert_eq!(resource_id(&fresh), "declared");
        assert_eq!(resource_config(&fresh)["a"], json!(1));

        let retried = instance(
            "net",
            "cloudify.nodes.vcloud.RoutedVDCNetwork",
            json!({"resource_id": "declared", "resource_config": {"a": 1}}),
            json!({"resource_id": "persisted", "resource_config": {"a": 2}}),
        );
        assert_eq!(resource_id(&retried), "persisted");
        assert_eq!(resource_config(&retried)["a"], json!(2));

        let bare = instance("net", "cloudify.nodes.vcloud.RoutedVDCNetwork", json!({}), json!({}));
        assert_eq!(resource_id(&bare), "net_a1b2c3");
        assert!(resource_config(&bare).is_empty());
    }

    #[test]
    fn test_resolve_relationship() {
        let disk = instance(
            "disk",
            "cloudify.nodes.vcloud.Disk",
            json!({"client_config": client_config(), "resource_id": "data-disk"}),
            json!({}),
        );
        let vm = instance(
            "vm",
            "cloudify.nodes.vcloud.VM",
            json!({"client_config": client_config(), "resource_id": "web-1"}),
            json!({}),
        );
        let ctx = OperationContext::relationship(
            "cloudify.interfaces.relationship_lifecycle.establish.attach",
            disk,
            vm,
            RelationshipSide::Source,
        )
        .with_retry(1);

        let data = resolve(&ctx, &connector()).unwrap();
        assert_eq!(data.kind, ResourceKind::Disk);
        assert_eq!(data.primary.adapter, AdapterKind::Disk);
        assert_eq!(data.primary.resource_id, "data-disk");
        assert!(data.primary.external);
        let secondary = data.secondary.unwrap();
        assert_eq!(secondary.adapter, AdapterKind::Vm);
        assert_eq!(secondary.resource_id, "web-1");
        assert_eq!(secondary.vdc, "vdc1");
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let node = instance("x", "cloudify.nodes.Compute", json!({"client_config": client_config()}), json!({}));
        let err = resolve(&OperationContext::node_instance("create", node), &connector()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_missing_credentials_fail_before_any_call() {
        let node = instance(
            "net",
            "cloudify.nodes.vcloud.IsolatedVDCNetwork",
            json!({"client_config": {"user": "u", "org": "acme"}}),
            json!({}),
        );
        let err = resolve(&OperationContext::node_instance("create", node), &connector()).unwrap_err();
        assert!(matches!(err, Error::MissingConfigKey(ref key) if key == "password"));
    }
}
