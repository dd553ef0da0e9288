//! netcore — combined DHCPv4 and DNS service for one subnet, backed by a
//! shared key/value store.
//!
//! The binary owns everything environmental: flag parsing, environment
//! variables, and instance identity. The core services never touch process
//! state; they receive an [`Identity`] and a store handle.

use anyhow::Context;
use clap::Parser;
use netcore_common::Identity;
use netcore_server::SetOverrides;
use netcore_store::{create_store, StoreConfig};
use std::process::Command;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "netcore", version, about = "DHCP + DNS service backed by a shared store")]
struct Cli {
    /// Comma-separated store endpoints. Defaults to $ETCD_PORT (with
    /// tcp:// rewritten to http://), then to http://etcd:2379.
    #[arg(long)]
    etcd: Option<String>,

    /// Use the in-memory store instead of etcd (single instance, volatile).
    #[arg(long)]
    memory_store: bool,

    /// Overwrite (permanently) the zone this instance is in.
    #[arg(long, value_name = "name")]
    set_zone: Option<String>,

    /// Overwrite (permanently) the DHCP hosting IP for this instance.
    /// An empty value disables DHCP.
    #[arg(long, value_name = "ip")]
    set_dhcp_ip: Option<String>,

    /// Overwrite (permanently) the DHCP hosting NIC for this instance.
    /// An empty value disables DHCP.
    #[arg(long, value_name = "name")]
    set_dhcp_nic: Option<String>,

    /// Overwrite (permanently) the DHCP pool subnet for this zone
    /// (requires a zone).
    #[arg(long, value_name = "cidr")]
    set_dhcp_subnet: Option<String>,

    /// Overwrite (permanently) the default DHCP lease duration in minutes
    /// for this zone (requires a zone).
    #[arg(long, value_name = "minutes")]
    set_dhcp_lease_duration: Option<String>,

    /// Overwrite (permanently) the DHCP TFTP server name for this
    /// instance. An empty value disables the option.
    #[arg(long, value_name = "name")]
    set_dhcp_tftp: Option<String>,
}

fn store_config(cli: &Cli) -> StoreConfig {
    if cli.memory_store {
        return StoreConfig::Memory;
    }
    let endpoints = match cli.etcd.clone().filter(|e| !e.is_empty()) {
        Some(csv) => csv,
        None => match std::env::var("ETCD_PORT") {
            Ok(port) if !port.is_empty() => port.replacen("tcp://", "http://", 1),
            _ => "http://etcd:2379".to_string(),
        },
    };
    StoreConfig::Etcd {
        endpoints: endpoints.split(',').map(|e| e.trim().to_string()).collect(),
    }
}

/// `hostname -f` equivalent, used as the identity of last resort.
fn fqdn() -> Option<String> {
    let output = Command::new("hostname").arg("-f").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let fqdn = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!fqdn.is_empty()).then_some(fqdn)
}

fn detect_identity() -> Option<Identity> {
    let netcore_name = std::env::var("NETCORE_NAME").ok();
    let etcd_name = std::env::var("ETCD_NAME").ok();
    let fqdn = fqdn();
    Identity::resolve(netcore_name.as_deref(), etcd_name.as_deref(), fqdn.as_deref())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let identity = detect_identity().context(
        "could not determine an instance identity (set NETCORE_NAME, ETCD_NAME, or a hostname)",
    )?;

    let store = create_store(&store_config(&cli)).context("store setup failed")?;

    let overrides = SetOverrides {
        zone: cli.set_zone,
        dhcp_ip: cli.set_dhcp_ip,
        dhcp_nic: cli.set_dhcp_nic,
        dhcp_subnet: cli.set_dhcp_subnet,
        dhcp_lease_minutes: cli.set_dhcp_lease_duration,
        dhcp_tftp: cli.set_dhcp_tftp,
    };

    netcore_server::run(store, identity, overrides).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
