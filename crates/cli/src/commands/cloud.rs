//! Simulated cloud snapshots

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;
use vcloud_provider::simulator::{self, InMemoryCloud};

use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum CloudCommands {
    /// Write a fresh snapshot
    Init {
        /// Snapshot file
        #[arg(long, env = "VCLOUD_CLOUD")]
        cloud: PathBuf,

        /// VDCs to create
        #[arg(long, default_value = "vdc1")]
        vdc: Vec<String>,

        /// Edge gateways, as VDC:NAME:ADDRESS
        #[arg(long)]
        gateway: Vec<String>,

        /// Media catalogs
        #[arg(long)]
        catalog: Vec<String>,

        /// Overwrite an existing snapshot
        #[arg(long)]
        force: bool,
    },

    /// Summarize a snapshot
    Show {
        /// Snapshot file
        #[arg(long, env = "VCLOUD_CLOUD")]
        cloud: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct VdcSummary {
    vdc: String,
    gateways: Vec<String>,
    networks: Vec<String>,
    vapps: Vec<String>,
    disks: Vec<String>,
}

impl TableDisplay for VdcSummary {
    fn headers() -> Vec<&'static str> {
        vec!["VDC", "Gateways", "Networks", "vApps", "Disks"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.vdc.clone(),
            self.gateways.join(", "),
            self.networks.join(", "),
            self.vapps.join(", "),
            self.disks.join(", "),
        ]
    }
}

/// Split a `VDC:NAME:ADDRESS` gateway argument.
fn parse_gateway(arg: &str) -> Result<(&str, &str, &str)> {
    let mut parts = arg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(vdc), Some(name), Some(address)) if !vdc.is_empty() && !name.is_empty() => {
            Ok((vdc, name, address))
        }
        _ => Err(anyhow!("Gateway must be VDC:NAME:ADDRESS, got {}", arg)),
    }
}

pub fn execute(cmd: CloudCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        CloudCommands::Init {
            cloud: path,
            vdc,
            gateway,
            catalog,
            force,
        } => {
            if path.exists() && !force {
                return Err(anyhow!(
                    "{} already exists; use --force to overwrite it",
                    path.display()
                ));
            }
            let mut cloud = InMemoryCloud::new();
            for name in &vdc {
                cloud = cloud.with_vdc(name);
            }
            for arg in &gateway {
                let (vdc, name, address) = parse_gateway(arg)?;
                cloud = cloud.with_gateway(vdc, name, address);
            }
            for name in &catalog {
                cloud = cloud.with_catalog(name);
            }
            std::fs::write(&path, cloud.to_json()?)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            print_success(&format!("Cloud snapshot written to {}", path.display()));
        }

        CloudCommands::Show { cloud: path } => {
            if !path.exists() {
                return Err(anyhow!("No cloud snapshot at {}", path.display()));
            }
            let state = simulator::load_or(&path, InMemoryCloud::new)?.snapshot();
            let summaries: Vec<VdcSummary> = state
                .vdcs
                .iter()
                .map(|(name, vdc)| VdcSummary {
                    vdc: name.clone(),
                    gateways: vdc.gateways.keys().cloned().collect(),
                    networks: vdc.networks.keys().cloned().collect(),
                    vapps: vdc
                        .vapps
                        .iter()
                        .map(|(vapp, record)| {
                            let vms: Vec<&str> = record.vms.keys().map(String::as_str).collect();
                            format!("{} [{}]", vapp, vms.join(" "))
                        })
                        .collect(),
                    disks: vdc.disks.iter().map(|d| d.name.clone()).collect(),
                })
                .collect();
            print_list(&summaries, format);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway() {
        assert_eq!(
            parse_gateway("vdc1:edge1:203.0.113.1").unwrap(),
            ("vdc1", "edge1", "203.0.113.1")
        );
        assert!(parse_gateway("edge1").is_err());
        assert!(parse_gateway(":edge1:1.2.3.4").is_err());
    }

    #[test]
    fn test_init_then_show() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.json");
        execute(
            CloudCommands::Init {
                cloud: path.clone(),
                vdc: vec!["vdc1".into()],
                gateway: vec!["vdc1:edge1:203.0.113.1".into()],
                catalog: vec!["isos".into()],
                force: false,
            },
            OutputFormat::Json,
        )
        .unwrap();

        let state = simulator::load_or(&path, InMemoryCloud::new).unwrap().snapshot();
        assert!(state.vdcs["vdc1"].gateways.contains_key("edge1"));
        assert!(state.catalogs.contains_key("isos"));

        let again = CloudCommands::Init {
            cloud: path,
            vdc: vec![],
            gateway: vec![],
            catalog: vec![],
            force: false,
        };
        assert!(execute(again, OutputFormat::Json).is_err());
    }
}
