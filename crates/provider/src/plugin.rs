//! Plugin entry point
//!
//! One [`Plugin`] serves every lifecycle operation the orchestrator invokes:
//! it refreshes the context from the state store, resolves the participants,
//! picks the task function, and hands the lot to the engine.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use vcloud_common::Result;

use crate::client::Connector;
use crate::config::PluginConfig;
use crate::context::{OperationContext, StateStore};
use crate::engine::{Engine, OperationReport};
use crate::resolver;
use crate::tasks::Operation;

pub struct Plugin {
    connector: Arc<dyn Connector>,
    store: Arc<dyn StateStore>,
    engine: Engine,
}

impl Plugin {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn StateStore>,
        config: PluginConfig,
    ) -> Self {
        Self {
            connector,
            engine: Engine::new(store.clone(), config),
            store,
        }
    }

    pub fn config(&self) -> &PluginConfig {
        self.engine.config()
    }

    /// Run one invocation. `Error::Retry` asks the orchestrator to call again
    /// with a higher retry number; any other error ends the workflow.
    #[instrument(skip_all, fields(operation = %ctx.operation, retry = ctx.retry_number))]
    pub async fn invoke(&self, mut ctx: OperationContext) -> Result<OperationReport> {
        ctx.refresh(self.store.as_ref())?;
        let data = resolver::resolve(&ctx, self.connector.as_ref())?;
        let operation = Operation::lookup(data.kind, ctx.verb(), ctx.is_relationship())?;
        info!(
            "{} {} ({:?}) external={}",
            ctx.operation, data.primary.resource_id, operation, data.primary.external
        );

        let result = self.engine.run(&ctx, &data, &operation).await;
        if let Err(err) = &result {
            if err.is_retryable() {
                info!("{} will be retried: {}", ctx.operation, err);
            } else {
                warn!("{} failed: {}", ctx.operation, err);
            }
        }
        result
    }
}
