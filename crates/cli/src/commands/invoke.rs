//! Invoke one lifecycle operation

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vcloud_provider::simulator::{self, InMemoryCloud};
use vcloud_provider::{OperationContext, OperationReport, Plugin, PluginConfig, SharedConnector};

use super::state::open_store;
use super::EXIT_RETRY;
use crate::output::{print_error, print_item, print_value, print_warning, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct InvokeArgs {
    /// Operation context as JSON
    #[arg(short, long)]
    pub context: PathBuf,

    /// Cloud snapshot to run against; written back after the call
    #[arg(long, env = "VCLOUD_CLOUD")]
    pub cloud: Option<PathBuf>,

    /// Plugin settings (TOML)
    #[arg(long, env = "VCLOUD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the retry number in the context
    #[arg(long)]
    pub retry: Option<u32>,
}

#[derive(Serialize)]
struct ReportRow<'a> {
    #[serde(flatten)]
    report: &'a OperationReport,
}

impl TableDisplay for ReportRow<'_> {
    fn headers() -> Vec<&'static str> {
        vec!["Instance", "Operation", "Resource", "Completion", "Properties"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.report.instance_id.clone(),
            self.report.operation.clone(),
            self.report.resource_id.clone(),
            format!("{:?}", self.report.completion),
            self.report.runtime_properties.len().to_string(),
        ]
    }
}

fn load_context(path: &Path) -> Result<OperationContext> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read context {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid context {}", path.display()))
}

fn load_cloud(path: Option<&Path>) -> Result<InMemoryCloud> {
    match path {
        Some(path) => Ok(simulator::load_or(path, InMemoryCloud::new)?),
        None => {
            print_warning("No cloud snapshot given; running against an empty cloud.");
            Ok(InMemoryCloud::new())
        }
    }
}

fn save_cloud(cloud: &InMemoryCloud, path: Option<&Path>) -> Result<()> {
    if let Some(path) = path {
        std::fs::write(path, cloud.to_json()?)
            .with_context(|| format!("Cannot write cloud snapshot {}", path.display()))?;
        debug!("Cloud snapshot written to {}", path.display());
    }
    Ok(())
}

/// Run the operation and return the process exit code.
pub async fn execute(args: InvokeArgs, state_db: &Path, format: OutputFormat) -> Result<i32> {
    let mut ctx = load_context(&args.context)?;
    if let Some(retry) = args.retry {
        ctx = ctx.with_retry(retry);
    }
    let config = match &args.config {
        Some(path) => PluginConfig::load(path)?,
        None => PluginConfig::default(),
    };

    let cloud = Arc::new(load_cloud(args.cloud.as_deref())?);
    let store = Arc::new(open_store(state_db)?);
    let plugin = Plugin::new(Arc::new(SharedConnector::new(cloud.clone())), store, config);

    info!("Invoking {} (retry {})", ctx.operation, ctx.retry_number);
    let result = plugin.invoke(ctx).await;
    save_cloud(&cloud, args.cloud.as_deref())?;

    match result {
        Ok(report) => {
            print_item(&ReportRow { report: &report }, format);
            if matches!(format, OutputFormat::Table) {
                print_value(&serde_json::Value::Object(report.runtime_properties), format);
            }
            Ok(0)
        }
        Err(err) if err.is_retryable() => {
            print_warning(&err.to_string());
            Ok(EXIT_RETRY)
        }
        Err(err) => {
            print_error(&err.to_string());
            Ok(1)
        }
    }
}
