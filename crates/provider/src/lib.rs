//! vCloud Director resource lifecycle provider
//!
//! Implements lifecycle operations (create, configure, start, stop, delete and
//! the relationship operations) for vCloud Director resources on behalf of a
//! topology orchestrator. Each invocation is idempotent and may be retried
//! arbitrarily often.

pub mod classifier;
pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod plugin;
pub mod resolver;
pub mod resources;
pub mod simulator;
pub mod state;
pub mod tasks;

pub use client::{Connector, SharedConnector, TaskHandle, VcdClient};
pub use config::{ClientConfig, PluginConfig};
pub use context::{
    InstanceContext, MemoryStateStore, NodeContext, OperationContext, RelationshipRecord,
    RelationshipSide, StateStore,
};
pub use engine::{Completion, Engine, OperationReport};
pub use plugin::Plugin;
pub use simulator::InMemoryCloud;
pub use tasks::Operation;
