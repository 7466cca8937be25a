//! Inspect the runtime-property store

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::Path;
use vcloud_common::Database;

use crate::output::{print_list, print_success, print_value, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum StateCommands {
    /// List instances with stored properties
    List,

    /// Show the runtime properties of an instance
    Show {
        /// Node instance id
        instance_id: String,
    },

    /// Forget an instance
    Clear {
        /// Node instance id
        instance_id: String,
    },
}

#[derive(Debug, Serialize)]
struct InstanceRow {
    instance_id: String,
    revision: i64,
    updated_at: String,
    keys: usize,
}

impl TableDisplay for InstanceRow {
    fn headers() -> Vec<&'static str> {
        vec!["Instance", "Revision", "Updated", "Keys"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.instance_id.clone(),
            self.revision.to_string(),
            self.updated_at.clone(),
            self.keys.to_string(),
        ]
    }
}

/// Open the store, creating its directory on first use.
pub fn open_store(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    Ok(Database::open(path)?)
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

pub fn execute(cmd: StateCommands, state_db: &Path, format: OutputFormat) -> Result<()> {
    let db = open_store(state_db)?;
    match cmd {
        StateCommands::List => {
            let mut rows = Vec::new();
            for instance_id in db.list_instances()? {
                if let Some(stored) = db.get_properties(&instance_id)? {
                    rows.push(InstanceRow {
                        instance_id,
                        revision: stored.revision,
                        updated_at: format_timestamp(stored.updated_at),
                        keys: stored.properties.len(),
                    });
                }
            }
            print_list(&rows, format);
        }

        StateCommands::Show { instance_id } => {
            let stored = db
                .get_properties(&instance_id)?
                .ok_or_else(|| anyhow!("No runtime properties for {}", instance_id))?;
            print_value(&serde_json::Value::Object(stored.properties), format);
        }

        StateCommands::Clear { instance_id } => {
            if db.delete_properties(&instance_id)? {
                print_success(&format!("Forgot {}", instance_id));
            } else {
                return Err(anyhow!("No runtime properties for {}", instance_id));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        open_store(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
    }
}
