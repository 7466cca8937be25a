//! Operation Engine
//!
//! Drives one lifecycle invocation through PROBE, ADOPT, POLL and EXPOSE:
//!
//! - PROBE runs the task function as a managed call, unless the primary is
//!   external.
//! - ADOPT runs it again with `external` set when PROBE produced no resource,
//!   so the task looks the resource up instead of mutating it.
//! - POLL waits (bounded) for the task PROBE started.
//! - EXPOSE writes the outcome into the primary's runtime-property bag.
//!
//! Errors are classified once, here. The engine never sleeps or loops: a
//! retryable error asks the orchestrator to call again.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vcloud_common::{Element, Error, ProviderError, Result, RuntimeProperties, TaskStatus};

use crate::classifier::{self, ErrorKind, Phase, Policy};
use crate::client::extract_task;
use crate::config::PluginConfig;
use crate::context::{OperationContext, StateStore};
use crate::resolver::ResourceData;
use crate::resources::Resource;
use crate::state;
use crate::tasks::{ResourceTask, TaskCall, TaskOutcome};

pub const PENDING_MESSAGE: &str = "Pending for operation completion.";

/// How an invocation ended, when it did not raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The resource was created, changed or looked up and its state exposed
    Completed,
    /// A missing resource was tolerated for this verb
    NotFoundIgnored,
    /// The task had nothing to do
    NoOp,
}

/// Result of a successful invocation
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub instance_id: String,
    pub operation: String,
    pub resource_id: String,
    pub completion: Completion,
    pub runtime_properties: RuntimeProperties,
}

/// Runs task functions and owns every write to the primary's bag
pub struct Engine {
    store: Arc<dyn StateStore>,
    config: PluginConfig,
}

/// Per-invocation bookkeeping
struct Run<'a> {
    ctx: &'a OperationContext,
    data: &'a ResourceData,
    bag: RuntimeProperties,
}

impl Run<'_> {
    fn verb(&self) -> &str {
        self.ctx.verb()
    }

    fn resource_id(&self) -> &str {
        &self.data.primary.resource_id
    }

    fn instance_id(&self) -> &str {
        &self.ctx.primary().instance_id
    }
}

impl Engine {
    pub fn new(store: Arc<dyn StateStore>, config: PluginConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn save(&self, run: &Run<'_>) -> Result<()> {
        self.store.save(run.instance_id(), &run.bag)
    }

    /// Set the sticky flag, persist it right away, and ask for a retry.
    fn retry_sticky(&self, run: &mut Run<'_>, message: String) -> Error {
        run.bag
            .insert(state::RETRY_BAD_REQUEST.to_string(), Value::Bool(true));
        if let Err(err) = self.save(run) {
            error!("Failed to persist retry flag for {}: {}", run.instance_id(), err);
            return err;
        }
        Error::Retry(message)
    }

    fn not_found_ok(&self, verb: &str) -> bool {
        self.config.is_not_found_ok(verb)
    }

    /// Turn an error from the managed call into a decision. `Ok` means the
    /// error was tolerated.
    fn handle_probe_error(&self, run: &mut Run<'_>, err: ProviderError) -> Result<()> {
        let kind = classifier::classify(&err, Phase::Probe);
        let policy = classifier::policy(kind, run.verb(), &self.config.not_found_ok);
        debug!(
            "{} on {} failed with {:?}, matched {:?}",
            run.verb(),
            run.resource_id(),
            kind,
            classifier::matching_predicates(&err)
        );
        match policy {
            Policy::Ignore => {
                error!(
                    "Attempted to perform {} operation on {}, but the resource was not found.",
                    run.verb(),
                    run.resource_id()
                );
                Ok(())
            }
            Policy::Retry { sticky } => {
                warn!(
                    "Failed to execute {} on {}, will retry: {}",
                    run.verb(),
                    run.resource_id(),
                    err
                );
                if sticky {
                    Err(self.retry_sticky(run, err.to_string()))
                } else {
                    Err(Error::Retry(err.to_string()))
                }
            }
            Policy::Fatal | Policy::Propagate => {
                error!(
                    "Failed to execute {} on {}: {}",
                    run.verb(),
                    run.resource_id(),
                    err
                );
                match policy {
                    Policy::Fatal if kind == ErrorKind::NotFound => {
                        Err(Error::NonRecoverable(format!(
                            "The expected resource {} does not exist. {}",
                            run.resource_id(),
                            err
                        )))
                    }
                    Policy::Fatal => Err(Error::NonRecoverable(err.to_string())),
                    _ => Err(Error::Provider(err)),
                }
            }
        }
    }

    /// Persist what a failed task staged so that the next attempt sees it.
    fn keep_staged(&self, run: &mut Run<'_>, call: &TaskCall<'_>) -> Result<()> {
        let staged = call.take_staged();
        if staged.is_empty() {
            return Ok(());
        }
        merge_staged(&mut run.bag, staged);
        self.save(run)
    }

    fn handle_adopt_error(&self, run: &mut Run<'_>, err: ProviderError) -> Result<()> {
        let kind = classifier::classify(&err, Phase::Adopt);
        match classifier::policy(kind, run.verb(), &self.config.not_found_ok) {
            Policy::Ignore => {
                error!(
                    "Attempted to perform {} operation on {}, but the resource was not found.",
                    run.verb(),
                    run.resource_id()
                );
                Ok(())
            }
            Policy::Fatal if kind == ErrorKind::NotFound => Err(Error::NonRecoverable(format!(
                "The expected resource {} does not exist.",
                run.resource_id()
            ))),
            Policy::Fatal => Err(Error::NonRecoverable(err.to_string())),
            Policy::Retry { sticky: true } => Err(self.retry_sticky(run, err.to_string())),
            Policy::Retry { sticky: false } => Err(Error::Retry(err.to_string())),
            Policy::Propagate => Err(Error::Provider(err)),
        }
    }

    /// Poll the last task. `Ok(())` means it succeeded.
    async fn poll(
        &self,
        run: &mut Run<'_>,
        resource: &dyn Resource,
        task: &Element,
    ) -> Result<()> {
        let Some(handle) = extract_task(task) else {
            return Ok(());
        };
        debug!("Task: {:?}", task.items());
        match resource
            .client()
            .wait_for_task(&handle, self.config.poll_timeout())
            .await
        {
            Ok(TaskStatus::Success) => Ok(()),
            Ok(status) => {
                info!(
                    "Task {} ({}) of {} is {}",
                    handle.id,
                    handle.operation,
                    run.resource_id(),
                    status
                );
                Err(self.retry_sticky(run, PENDING_MESSAGE.to_string()))
            }
            Err(err) => match classifier::classify(&err, Phase::Poll) {
                ErrorKind::Blocked => Err(Error::NonRecoverable(err.to_string())),
                ErrorKind::TaskValidation => Err(Error::Retry(format!(
                    "Unhandled state validation error: {}.",
                    err
                ))),
                ErrorKind::Transient => Err(self.retry_sticky(run, err.to_string())),
                _ => Err(Error::Provider(err)),
            },
        }
    }

    /// Write the outcome of a successful invocation into the bag.
    async fn expose(
        &self,
        run: &mut Run<'_>,
        resource: Option<&dyn Resource>,
        staged: RuntimeProperties,
    ) -> Result<()> {
        let verb = run.verb().to_string();
        if verb.contains("delete") {
            run.bag.clear();
            run.bag
                .insert(state::DELETED.to_string(), Value::Bool(true));
            return self.save(run);
        }

        let mut update = RuntimeProperties::new();
        if verb.contains("create") {
            update.insert(state::CREATED.to_string(), Value::Bool(true));
        }
        if let Some(resource) = resource.filter(|_| !self.not_found_ok(&verb)) {
            let data = resource.exposed_data().await.map_err(|err| match err {
                ProviderError::EntityNotFound(_) | ProviderError::NotFound(_) => {
                    Error::NonRecoverable(format!("The resource {} was not found.", resource.name()))
                }
                other => Error::Provider(other),
            })?;
            update.insert(
                state::RESOURCE_ID.to_string(),
                Value::String(resource.name().to_string()),
            );
            update.insert(state::DATA.to_string(), data.to_plain());
            update.insert(state::TASKS.to_string(), resource.tasks().to_value());
        }
        update.insert(state::RETRY_BAD_REQUEST.to_string(), Value::Bool(false));

        merge_staged(&mut run.bag, staged);
        state::merge(&mut run.bag, update);
        self.save(run)
    }

    /// Run one invocation of `task` for the resolved participants.
    pub async fn run(
        &self,
        ctx: &OperationContext,
        data: &ResourceData,
        task: &dyn ResourceTask,
    ) -> Result<OperationReport> {
        let mut run = Run {
            ctx,
            data,
            bag: ctx.primary().runtime_properties.clone(),
        };
        let mut call = TaskCall::new(ctx, data, self.config.poll_timeout());
        let mut resource: Option<Box<dyn Resource>> = None;
        let mut last_task: Option<Element> = None;
        let mut completion = Completion::Completed;

        // PROBE
        if !data.primary.external {
            debug!(
                "Executing {} on {} (retry {})",
                ctx.operation,
                run.resource_id(),
                ctx.retry_number
            );
            match task.execute(&call).await {
                Ok(TaskOutcome::Success { resource: r, task }) => {
                    resource = Some(r);
                    last_task = task;
                }
                Ok(TaskOutcome::Adopted { resource: r }) => resource = Some(r),
                Ok(TaskOutcome::NoOp) => completion = Completion::NoOp,
                Err(Error::Provider(err)) => {
                    self.keep_staged(&mut run, &call)?;
                    self.handle_probe_error(&mut run, err)?;
                    completion = Completion::NotFoundIgnored;
                }
                Err(err) => {
                    self.keep_staged(&mut run, &call)?;
                    return Err(err);
                }
            }
        }

        // ADOPT
        if resource.is_none() && completion != Completion::NoOp {
            call.external = true;
            debug!("Looking up {} for {}", run.resource_id(), run.verb());
            match task.execute(&call).await {
                Ok(TaskOutcome::Success { resource: r, .. })
                | Ok(TaskOutcome::Adopted { resource: r }) => resource = Some(r),
                Ok(TaskOutcome::NoOp) => completion = Completion::NoOp,
                Err(Error::Provider(err)) => {
                    self.keep_staged(&mut run, &call)?;
                    self.handle_adopt_error(&mut run, err)?;
                    completion = Completion::NotFoundIgnored;
                }
                Err(err) => {
                    self.keep_staged(&mut run, &call)?;
                    return Err(err);
                }
            }
        }

        let staged = call.take_staged();
        if !staged.is_empty() {
            merge_staged(&mut run.bag, staged.clone());
            self.save(&run)?;
        }

        // POLL
        if let Some(task) = &last_task {
            match &resource {
                Some(resource) => self.poll(&mut run, resource.as_ref(), task).await?,
                None => return Err(self.retry_sticky(&mut run, PENDING_MESSAGE.to_string())),
            }
        }

        // EXPOSE
        self.expose(&mut run, resource.as_deref(), staged).await?;
        if completion == Completion::NotFoundIgnored && resource.is_some() {
            completion = Completion::Completed;
        }
        if resource.is_none() && completion == Completion::Completed {
            warn!("{} on {} finished without a resource", ctx.operation, run.resource_id());
        }
        info!(
            "Operation {} on {} finished: {:?}",
            ctx.operation,
            run.resource_id(),
            completion
        );

        Ok(OperationReport {
            instance_id: run.instance_id().to_string(),
            operation: ctx.operation.clone(),
            resource_id: run.resource_id().to_string(),
            completion,
            runtime_properties: run.bag,
        })
    }
}

/// Merge staged properties; a null value removes its key.
fn merge_staged(bag: &mut RuntimeProperties, staged: RuntimeProperties) {
    for (key, value) in staged {
        if value.is_null() {
            bag.remove(&key);
        } else {
            bag.insert(key, value);
        }
    }
}
