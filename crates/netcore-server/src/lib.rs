//! Service supervisor.
//!
//! Loads and validates the merged configuration, persists any operator
//! overrides, then starts the DHCP listener (when the instance is equipped
//! for it) and the DNS listeners. The first service to exit — cleanly or
//! not — brings the process down with a message naming it.

pub mod config;

pub use config::{load_config, DnsSettings, LoadedConfig};

use anyhow::{anyhow, Context};
use netcore_common::Identity;
use netcore_dhcp::{DhcpConfig, DhcpServer, DhcpService};
use netcore_dns::{DnsCache, DnsHandler, DnsServer, Resolve, Resolver, ResolverConfig};
use netcore_store::Store;
use netcore_wol::WolService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const DNS_BIND: &str = "0.0.0.0:53";

/// Operator overrides persisted to the store before loading configuration.
///
/// An explicitly empty value is written as-is and disables the feature it
/// configures.
#[derive(Debug, Clone, Default)]
pub struct SetOverrides {
    pub zone: Option<String>,
    pub dhcp_ip: Option<String>,
    pub dhcp_nic: Option<String>,
    pub dhcp_subnet: Option<String>,
    pub dhcp_lease_minutes: Option<String>,
    pub dhcp_tftp: Option<String>,
}

impl SetOverrides {
    pub fn is_empty(&self) -> bool {
        self.zone.is_none()
            && self.dhcp_ip.is_none()
            && self.dhcp_nic.is_none()
            && self.dhcp_subnet.is_none()
            && self.dhcp_lease_minutes.is_none()
            && self.dhcp_tftp.is_none()
    }
}

/// Persist operator overrides.
///
/// Zone-scoped values (`pool`, `leaseduration`) need a zone to write under:
/// either the one being set right now or the instance's existing one.
pub async fn apply_overrides(
    store: &Arc<dyn Store>,
    identity: &Identity,
    overrides: &SetOverrides,
) -> anyhow::Result<()> {
    let instance_root = format!("config/instance/{}", identity.name);

    if let Some(ref zone) = overrides.zone {
        store.set(&format!("{instance_root}/network"), zone, None).await?;
    }
    if let Some(ref ip) = overrides.dhcp_ip {
        store.set(&format!("{instance_root}/dhcpip"), ip, None).await?;
    }
    if let Some(ref nic) = overrides.dhcp_nic {
        store.set(&format!("{instance_root}/dhcpnic"), nic, None).await?;
    }
    if let Some(ref tftp) = overrides.dhcp_tftp {
        store.set(&format!("{instance_root}/dhcptftp"), tftp, None).await?;
    }

    if overrides.dhcp_subnet.is_some() || overrides.dhcp_lease_minutes.is_some() {
        let zone = match overrides.zone.clone() {
            Some(zone) if !zone.is_empty() => Some(zone),
            _ => store
                .get(&format!("{instance_root}/network"), false, false)
                .await?
                .map(|n| n.value)
                .filter(|v| !v.is_empty()),
        };
        let Some(zone) = zone else {
            warn!("zone-scoped overrides ignored: no zone selected");
            return Ok(());
        };
        if let Some(ref subnet) = overrides.dhcp_subnet {
            store.set(&format!("network/{zone}/pool"), subnet, None).await?;
        }
        if let Some(ref minutes) = overrides.dhcp_lease_minutes {
            store
                .set(&format!("network/{zone}/leaseduration"), minutes, None)
                .await?;
        }
    }
    Ok(())
}

/// Run the whole service: returns only when a subsystem has exited, always
/// with an error naming it.
pub async fn run(
    store: Arc<dyn Store>,
    identity: Identity,
    overrides: SetOverrides,
) -> anyhow::Result<()> {
    if !overrides.is_empty() {
        apply_overrides(&store, &identity, &overrides)
            .await
            .context("failed to persist overrides")?;
    }

    let cfg = load_config(&store, &identity)
        .await
        .context("configuration failed")?;
    info!(instance = %identity, network = %cfg.network, "configuration loaded");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (exit_tx, mut exit_rx) = mpsc::channel::<(&'static str, anyhow::Result<()>)>(2);

    // DHCP runs only when the instance is equipped for it.
    match dhcp_service(&store, &cfg) {
        Some(service) => {
            let server = DhcpServer::new(service);
            let exit_tx = exit_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let result = server.run(shutdown_rx).await;
                let _ = exit_tx.send(("DHCP", result.map_err(Into::into))).await;
            });
        }
        None => info!("DHCP service disabled for this instance"),
    }

    // DNS always runs.
    {
        let resolver = Resolver::new(
            store.clone(),
            ResolverConfig {
                forwarders: cfg.dns.forwarders.clone(),
                ..Default::default()
            },
        );
        let cache = DnsCache::new(
            cfg.dns.cache_max_ttl,
            cfg.dns.cache_miss_ttl,
            Arc::new(resolver) as Arc<dyn Resolve>,
        );
        let wol = Arc::new(WolService::new(store.clone(), cfg.network.clone()));
        let handler = DnsHandler::new(Arc::new(cache), Some(wol));
        let bind: SocketAddr = DNS_BIND.parse().expect("static bind address");
        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            let result = DnsServer::start(bind, handler).await;
            let _ = exit_tx.send(("DNS", result)).await;
        });
    }

    info!("netcore started");

    let (name, result) = exit_rx
        .recv()
        .await
        .ok_or_else(|| anyhow!("all services vanished"))?;
    match result {
        Ok(()) => Err(anyhow!("{name} service exited")),
        Err(e) => Err(anyhow!("{name} service exited: {e:#}")),
    }
}

/// Build the DHCP engine if the instance has an IP, a NIC, and a pool.
fn dhcp_service(store: &Arc<dyn Store>, cfg: &LoadedConfig) -> Option<DhcpService> {
    if !cfg.server.enabled {
        info!("DHCP disabled by configuration");
        return None;
    }
    let Some(server_ip) = cfg.server.ip else {
        info!("no DHCP IP assigned");
        return None;
    };
    let Some(nic) = cfg.server.nic.clone() else {
        info!("no DHCP NIC assigned");
        return None;
    };
    let Some(pool) = cfg.binding.pool else {
        info!("no DHCP pool assigned for this network");
        return None;
    };
    let subnet = cfg.server.subnet?;

    Some(DhcpService::new(
        store.clone(),
        cfg.network.clone(),
        DhcpConfig {
            server_ip,
            nic,
            subnet,
            pool,
            binding: cfg.binding.clone(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_store::MemoryStore;

    #[tokio::test]
    async fn test_apply_overrides_writes_scopes() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let identity = Identity::new("ns1");
        let overrides = SetOverrides {
            zone: Some("lab".to_string()),
            dhcp_ip: Some("10.0.0.2".to_string()),
            dhcp_subnet: Some("10.0.0.128/25".to_string()),
            dhcp_lease_minutes: Some("120".to_string()),
            ..Default::default()
        };

        apply_overrides(&store, &identity, &overrides).await.unwrap();

        let zone = store.get("config/instance/ns1/network", false, false).await.unwrap().unwrap();
        assert_eq!(zone.value, "lab");
        let pool = store.get("network/lab/pool", false, false).await.unwrap().unwrap();
        assert_eq!(pool.value, "10.0.0.128/25");
        let lease = store.get("network/lab/leaseduration", false, false).await.unwrap().unwrap();
        assert_eq!(lease.value, "120");
    }

    #[tokio::test]
    async fn test_zone_scoped_override_without_zone_ignored() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let overrides = SetOverrides {
            dhcp_subnet: Some("10.0.0.0/24".to_string()),
            ..Default::default()
        };

        apply_overrides(&store, &Identity::new("ns1"), &overrides).await.unwrap();
        assert!(store.get("network", true, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_override_disables() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/instance/ns1/dhcpip", "10.0.0.2", None).await.unwrap();

        let overrides = SetOverrides {
            dhcp_ip: Some(String::new()),
            ..Default::default()
        };
        apply_overrides(&store, &Identity::new("ns1"), &overrides).await.unwrap();

        let node = store.get("config/instance/ns1/dhcpip", false, false).await.unwrap().unwrap();
        assert_eq!(node.value, "");
    }

    #[tokio::test]
    async fn test_dhcp_service_requires_equipment() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/instance/ns1/network", "lab", None).await.unwrap();
        store.set("network/lab/subnet", "10.0.0.0/24", None).await.unwrap();
        store.set("network/lab/gateway", "10.0.0.1", None).await.unwrap();
        let cfg = load_config(&store, &Identity::new("ns1")).await.unwrap();

        // No IP, NIC, or pool: DHCP is skipped, not an error.
        assert!(dhcp_service(&store, &cfg).is_none());

        store.set("config/instance/ns1/dhcpip", "10.0.0.2", None).await.unwrap();
        store.set("config/instance/ns1/dhcpnic", "eth0", None).await.unwrap();
        store.set("network/lab/pool", "10.0.0.0/24", None).await.unwrap();
        let cfg = load_config(&store, &Identity::new("ns1")).await.unwrap();
        assert!(dhcp_service(&store, &cfg).is_some());
    }
}
