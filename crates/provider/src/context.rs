//! Orchestrator operation context
//!
//! The orchestrator hands every lifecycle call a context describing the node
//! instance (or both ends of a relationship). It is passed explicitly to every
//! function that needs it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use vcloud_common::{Database, Result, RuntimeProperties};

use crate::state;

/// Static node template data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeContext {
    pub id: String,
    /// Most specific type first
    pub type_hierarchy: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// An outgoing relationship of a node instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub type_hierarchy: Vec<String>,
    pub target_id: String,
    #[serde(default)]
    pub target_runtime_properties: RuntimeProperties,
}

/// One node instance as the orchestrator sees it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceContext {
    pub node: NodeContext,
    pub instance_id: String,
    #[serde(default)]
    pub runtime_properties: RuntimeProperties,
    #[serde(default)]
    pub relationships: Vec<RelationshipRecord>,
}

impl InstanceContext {
    /// Relationships whose type hierarchy includes `rel_type`.
    pub fn find_rels_by_type<'a>(
        &'a self,
        rel_type: &'a str,
    ) -> impl Iterator<Item = &'a RelationshipRecord> + 'a {
        self.relationships
            .iter()
            .filter(move |rel| rel.type_hierarchy.iter().any(|t| t == rel_type))
    }

    /// The single relationship of a type, if there is exactly one.
    pub fn find_rel_by_type<'a>(&'a self, rel_type: &'a str) -> Option<&'a RelationshipRecord> {
        let mut rels = self.find_rels_by_type(rel_type);
        match (rels.next(), rels.next()) {
            (Some(rel), None) => Some(rel),
            _ => None,
        }
    }

    /// Persisted `resource_id` of the target of a relationship type.
    pub fn related_resource_id(&self, rel_type: &str) -> Option<String> {
        self.find_rel_by_type(rel_type)?
            .target_runtime_properties
            .get(state::RESOURCE_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Which end of a relationship the operation runs for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipSide {
    Source,
    Target,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextKind {
    NodeInstance {
        instance: InstanceContext,
    },
    Relationship {
        source: InstanceContext,
        target: InstanceContext,
        /// The "self" side; it becomes the primary descriptor.
        side: RelationshipSide,
    },
}

/// Context of one lifecycle operation invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// Dotted operation name; the last segment is the verb
    pub operation: String,
    #[serde(default)]
    pub retry_number: u32,
    pub kind: ContextKind,
}

impl OperationContext {
    pub fn node_instance(operation: impl Into<String>, instance: InstanceContext) -> Self {
        Self {
            operation: operation.into(),
            retry_number: 0,
            kind: ContextKind::NodeInstance { instance },
        }
    }

    pub fn relationship(
        operation: impl Into<String>,
        source: InstanceContext,
        target: InstanceContext,
        side: RelationshipSide,
    ) -> Self {
        Self {
            operation: operation.into(),
            retry_number: 0,
            kind: ContextKind::Relationship {
                source,
                target,
                side,
            },
        }
    }

    pub fn with_retry(mut self, retry_number: u32) -> Self {
        self.retry_number = retry_number;
        self
    }

    pub fn verb(&self) -> &str {
        self.operation.rsplit('.').next().unwrap_or(&self.operation)
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self.kind, ContextKind::Relationship { .. })
    }

    /// The instance whose bag receives the result
    pub fn primary(&self) -> &InstanceContext {
        match &self.kind {
            ContextKind::NodeInstance { instance } => instance,
            ContextKind::Relationship {
                source,
                target,
                side,
            } => match side {
                RelationshipSide::Source => source,
                RelationshipSide::Target => target,
            },
        }
    }

    /// The other end of a relationship
    pub fn secondary(&self) -> Option<&InstanceContext> {
        match &self.kind {
            ContextKind::NodeInstance { .. } => None,
            ContextKind::Relationship {
                source,
                target,
                side,
            } => Some(match side {
                RelationshipSide::Source => target,
                RelationshipSide::Target => source,
            }),
        }
    }

    fn instances_mut(&mut self) -> Vec<&mut InstanceContext> {
        match &mut self.kind {
            ContextKind::NodeInstance { instance } => vec![instance],
            ContextKind::Relationship { source, target, .. } => vec![source, target],
        }
    }

    /// Replace runtime properties with whatever the store holds.
    pub fn refresh(&mut self, store: &dyn StateStore) -> Result<()> {
        for instance in self.instances_mut() {
            if let Some(props) = store.load(&instance.instance_id)? {
                instance.runtime_properties = props;
            }
        }
        Ok(())
    }
}

/// Durable per-instance runtime-property bags
pub trait StateStore: Send + Sync {
    /// `None` when the instance was never saved.
    fn load(&self, instance_id: &str) -> Result<Option<RuntimeProperties>>;

    fn save(&self, instance_id: &str, props: &RuntimeProperties) -> Result<()>;
}

impl StateStore for Database {
    fn load(&self, instance_id: &str) -> Result<Option<RuntimeProperties>> {
        Ok(self.get_properties(instance_id)?.map(|stored| stored.properties))
    }

    fn save(&self, instance_id: &str, props: &RuntimeProperties) -> Result<()> {
        self.save_properties(instance_id, props).map(|_| ())
    }
}

/// In-memory store that keeps every save, for inspection in tests
#[derive(Default)]
pub struct MemoryStateStore {
    bags: Mutex<HashMap<String, RuntimeProperties>>,
    history: Mutex<Vec<(String, RuntimeProperties)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save, oldest first
    pub fn history(&self) -> Vec<(String, RuntimeProperties)> {
        self.history.lock().clone()
    }

    pub fn get(&self, instance_id: &str) -> Option<RuntimeProperties> {
        self.bags.lock().get(instance_id).cloned()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, instance_id: &str) -> Result<Option<RuntimeProperties>> {
        Ok(self.get(instance_id))
    }

    fn save(&self, instance_id: &str, props: &RuntimeProperties) -> Result<()> {
        self.bags
            .lock()
            .insert(instance_id.to_string(), props.clone());
        self.history
            .lock()
            .push((instance_id.to_string(), props.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(id: &str) -> InstanceContext {
        InstanceContext {
            node: NodeContext {
                id: id.to_string(),
                type_hierarchy: vec!["cloudify.nodes.Root".to_string()],
                properties: Map::new(),
            },
            instance_id: format!("{}_x1", id),
            ..Default::default()
        }
    }

    #[test]
    fn test_verb_is_last_segment() {
        let ctx = OperationContext::node_instance(
            "cloudify.interfaces.lifecycle.create",
            instance("net"),
        );
        assert_eq!(ctx.verb(), "create");
        assert!(!ctx.is_relationship());
        assert!(ctx.secondary().is_none());
    }

    #[test]
    fn test_relationship_self_side_is_primary() {
        let ctx = OperationContext::relationship(
            "cloudify.interfaces.relationship_lifecycle.unlink",
            instance("nic"),
            instance("vm"),
            RelationshipSide::Source,
        );
        assert_eq!(ctx.primary().node.id, "nic");
        assert_eq!(ctx.secondary().unwrap().node.id, "vm");

        let ctx = OperationContext::relationship(
            "unlink",
            instance("nic"),
            instance("vm"),
            RelationshipSide::Target,
        );
        assert_eq!(ctx.primary().node.id, "vm");
    }

    #[test]
    fn test_related_resource_id() {
        let mut nic = instance("nic");
        nic.relationships.push(RelationshipRecord {
            type_hierarchy: vec![
                "cloudify.relationships.vcloud.nic_connected_to_network".to_string(),
                "cloudify.relationships.connected_to".to_string(),
            ],
            target_id: "net_x1".to_string(),
            target_runtime_properties: json!({"resource_id": "net1"})
                .as_object()
                .cloned()
                .unwrap(),
        });
        assert_eq!(
            nic.related_resource_id("cloudify.relationships.vcloud.nic_connected_to_network"),
            Some("net1".to_string())
        );
        assert_eq!(nic.related_resource_id("cloudify.relationships.contained_in"), None);
    }

    #[test]
    fn test_refresh_from_store() {
        let store = MemoryStateStore::new();
        let mut props = Map::new();
        props.insert("__created".to_string(), json!(true));
        store.save("net_x1", &props).unwrap();

        let mut ctx = OperationContext::node_instance("create", instance("net"));
        ctx.refresh(&store).unwrap();
        assert_eq!(ctx.primary().runtime_properties["__created"], json!(true));
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn test_database_store() {
        let db = Database::open_memory().unwrap();
        assert!(StateStore::load(&db, "vm_x1").unwrap().is_none());
        let mut props = Map::new();
        props.insert("resource_id".to_string(), json!("vm1"));
        StateStore::save(&db, "vm_x1", &props).unwrap();
        assert_eq!(StateStore::load(&db, "vm_x1").unwrap(), Some(props));
    }
}
