//! vCloud plugin CLI
//!
//! Drives single lifecycle operations against a simulated vCloud Director
//! and inspects the runtime properties they leave behind.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{classify, cloud, invoke, state};

/// vCloud Director resource-lifecycle plugin
#[derive(Parser)]
#[command(name = "vcloud")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Runtime-property database
    #[arg(long, env = "VCLOUD_STATE_DB", global = true)]
    state_db: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one lifecycle operation
    Invoke(invoke::InvokeArgs),

    /// Show how an error would be classified
    Classify(classify::ClassifyArgs),

    /// Manage simulated cloud snapshots
    #[command(subcommand)]
    Cloud(cloud::CloudCommands),

    /// Inspect stored runtime properties
    #[command(subcommand)]
    State(state::StateCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let state_db = cli.state_db.unwrap_or_else(vcloud_common::default_db_path);

    match cli.command {
        Commands::Invoke(args) => {
            let code = invoke::execute(args, &state_db, cli.format).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Classify(args) => classify::execute(args, cli.format)?,
        Commands::Cloud(cmd) => cloud::execute(cmd, cli.format)?,
        Commands::State(cmd) => state::execute(cmd, &state_db, cli.format)?,
        Commands::Version => {
            println!("vcloud plugin v{}", vcloud_common::VERSION);
            println!("State database: {}", state_db.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_invoke() {
        let cli = Cli::try_parse_from([
            "vcloud",
            "--format",
            "json",
            "invoke",
            "--context",
            "ctx.json",
            "--retry",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Invoke(args) => {
                assert_eq!(args.context, PathBuf::from("ctx.json"));
                assert_eq!(args.retry, Some(2));
            }
            _ => panic!("expected invoke"),
        }
    }
}
