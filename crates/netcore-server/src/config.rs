//! Configuration loading.
//!
//! Server-side configuration is composed from three store scopes in layer
//! order: global, network, instance. The network id itself comes from the
//! instance scope (falling back to global) and selects which `network/<id>/`
//! subtree applies. Lease durations are stored in minutes; cache TTLs in
//! seconds.

use ipnet::Ipv4Net;
use netcore_common::{
    Binding, BindingPatch, ConfigError, Identity, ServerConfig, ServerPatch,
};
use netcore_dns::parse_forwarders;
use netcore_store::{Node, Store, StoreError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Default upstream resolvers when no scope configures any.
const DEFAULT_FORWARDERS: [&str; 2] = ["8.8.8.8:53", "8.8.4.4:53"];
const DEFAULT_CACHE_MAX_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CACHE_MISS_TTL: Duration = Duration::from_secs(30);

/// DNS-side settings drawn from the same scopes.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsSettings {
    pub forwarders: Vec<String>,
    pub cache_max_ttl: Duration,
    pub cache_miss_ttl: Duration,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            forwarders: DEFAULT_FORWARDERS.iter().map(|s| s.to_string()).collect(),
            cache_max_ttl: DEFAULT_CACHE_MAX_TTL,
            cache_miss_ttl: DEFAULT_CACHE_MISS_TTL,
        }
    }
}

/// Everything the supervisor needs to start services.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub network: String,
    pub server: ServerConfig,
    pub binding: Binding,
    pub dns: DnsSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Load and merge the configuration for one instance.
pub async fn load_config(
    store: &Arc<dyn Store>,
    identity: &Identity,
) -> Result<LoadedConfig, LoadError> {
    let global = store.get("config/global", true, true).await?;
    let instance = store
        .get(&format!("config/instance/{}", identity.name), true, true)
        .await?;

    let network_id = scalar(instance.as_ref(), "network")
        .or_else(|| scalar(global.as_ref(), "network"))
        .ok_or(ConfigError::NoConfigNetwork)?;

    let network = store
        .get(&format!("network/{network_id}"), true, true)
        .await?;

    let server = ServerConfig::merge([
        server_patch(global.as_ref(), &network_id)?,
        server_patch(network.as_ref(), &network_id)?,
        server_patch(instance.as_ref(), &network_id)?,
    ]);
    if server.subnet.is_none() {
        return Err(ConfigError::NoConfigSubnet.into());
    }

    let binding = Binding::merge([
        binding_patch(global.as_ref())?,
        binding_patch(network.as_ref())?,
        binding_patch(instance.as_ref())?,
    ]);
    binding.validate().map_err(LoadError::Config)?;

    let mut dns = DnsSettings::default();
    for scope in [global.as_ref(), network.as_ref()] {
        if let Some(forwarders) = scalar(scope, "dnsforwarders") {
            dns.forwarders = parse_forwarders(&forwarders);
        }
        if let Some(ttl) = parsed_secs(scope, "dnscachemaxttl")? {
            dns.cache_max_ttl = ttl;
        }
        if let Some(ttl) = parsed_secs(scope, "dnscachemissttl")? {
            dns.cache_miss_ttl = ttl;
        }
    }

    Ok(LoadedConfig {
        network: network_id,
        server,
        binding,
        dns,
    })
}

fn scalar(node: Option<&Node>, field: &str) -> Option<String> {
    node?
        .child(field)
        .filter(|n| !n.dir && !n.value.is_empty())
        .map(|n| n.value.clone())
}

fn server_patch(node: Option<&Node>, network_id: &str) -> Result<ServerPatch, ConfigError> {
    Ok(ServerPatch {
        network: Some(network_id.to_string()),
        nic: scalar(node, "dhcpnic"),
        ip: parse_field::<Ipv4Addr>(node, "dhcpip")?,
        subnet: parse_field::<Ipv4Net>(node, "subnet")?,
        enabled: match scalar(node, "enabled").as_deref() {
            Some("false") => Some(false),
            Some(_) => Some(true),
            None => None,
        },
    })
}

fn binding_patch(node: Option<&Node>) -> Result<BindingPatch, ConfigError> {
    Ok(BindingPatch {
        subnet: parse_field::<Ipv4Net>(node, "subnet")?,
        gateway: parse_field::<Ipv4Addr>(node, "gateway")?,
        domain: scalar(node, "domain"),
        tftp: scalar(node, "tftp").or_else(|| scalar(node, "dhcptftp")),
        ntp: parse_field::<Ipv4Addr>(node, "ntp")?,
        pool: parse_field::<Ipv4Net>(node, "pool")?,
        lease_duration: parsed_minutes(node, "leaseduration")?,
        ..Default::default()
    })
}

fn parse_field<T: std::str::FromStr>(
    node: Option<&Node>,
    field: &'static str,
) -> Result<Option<T>, ConfigError> {
    match scalar(node, field) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { field, value }),
        None => Ok(None),
    }
}

fn parsed_minutes(
    node: Option<&Node>,
    field: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_field::<u64>(node, field)?.map(|m| Duration::from_secs(m * 60)))
}

fn parsed_secs(node: Option<&Node>, field: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_field::<u64>(node, field)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_store::MemoryStore;

    async fn seeded() -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/instance/ns1/network", "lab", None).await.unwrap();
        store.set("config/instance/ns1/dhcpip", "10.0.0.2", None).await.unwrap();
        store.set("config/instance/ns1/dhcpnic", "eth0", None).await.unwrap();
        store.set("network/lab/subnet", "10.0.0.0/24", None).await.unwrap();
        store.set("network/lab/gateway", "10.0.0.1", None).await.unwrap();
        store.set("network/lab/domain", "lab.example.com", None).await.unwrap();
        store.set("network/lab/pool", "10.0.0.0/24", None).await.unwrap();
        store.set("network/lab/leaseduration", "720", None).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_full_config() {
        let store = seeded().await;
        let cfg = load_config(&store, &Identity::new("ns1")).await.unwrap();

        assert_eq!(cfg.network, "lab");
        assert_eq!(cfg.server.ip, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(cfg.server.nic.as_deref(), Some("eth0"));
        assert_eq!(cfg.server.subnet, Some("10.0.0.0/24".parse().unwrap()));
        assert!(cfg.server.validate().is_ok());

        assert_eq!(cfg.binding.gateway, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(cfg.binding.domain.as_deref(), Some("lab.example.com"));
        assert_eq!(cfg.binding.effective_lease_duration(), Duration::from_secs(43200));
        assert_eq!(cfg.dns, DnsSettings::default());
    }

    #[tokio::test]
    async fn test_network_from_global_fallback() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/global/network", "lab", None).await.unwrap();
        store.set("network/lab/subnet", "10.0.0.0/24", None).await.unwrap();
        store.set("network/lab/gateway", "10.0.0.1", None).await.unwrap();

        let cfg = load_config(&store, &Identity::new("anything")).await.unwrap();
        assert_eq!(cfg.network, "lab");
    }

    #[tokio::test]
    async fn test_missing_network_is_fatal() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let err = load_config(&store, &Identity::new("ns1")).await.unwrap_err();
        assert!(matches!(err, LoadError::Config(ConfigError::NoConfigNetwork)));
    }

    #[tokio::test]
    async fn test_missing_subnet_is_fatal() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/instance/ns1/network", "lab", None).await.unwrap();
        store.set("network/lab/gateway", "10.0.0.1", None).await.unwrap();

        let err = load_config(&store, &Identity::new("ns1")).await.unwrap_err();
        assert!(matches!(err, LoadError::Config(ConfigError::NoConfigSubnet)));
    }

    #[tokio::test]
    async fn test_missing_gateway_is_fatal() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/instance/ns1/network", "lab", None).await.unwrap();
        store.set("network/lab/subnet", "10.0.0.0/24", None).await.unwrap();

        let err = load_config(&store, &Identity::new("ns1")).await.unwrap_err();
        assert!(matches!(err, LoadError::Config(ConfigError::NoLeaseGateway)));
    }

    #[tokio::test]
    async fn test_instance_overrides_network() {
        let store = seeded().await;
        store.set("network/lab/dhcpnic", "eth9", None).await.unwrap();

        let cfg = load_config(&store, &Identity::new("ns1")).await.unwrap();
        // Instance scope is the last server layer.
        assert_eq!(cfg.server.nic.as_deref(), Some("eth0"));
    }

    #[tokio::test]
    async fn test_dns_settings_override() {
        let store = seeded().await;
        store
            .set("config/global/dnsforwarders", "1.1.1.1:53,9.9.9.9:53", None)
            .await
            .unwrap();
        store.set("network/lab/dnsforwarders", "!", None).await.unwrap();
        store.set("network/lab/dnscachemaxttl", "600", None).await.unwrap();

        let cfg = load_config(&store, &Identity::new("ns1")).await.unwrap();
        assert_eq!(cfg.dns.forwarders, vec!["!".to_string()]);
        assert_eq!(cfg.dns.cache_max_ttl, Duration::from_secs(600));
        assert_eq!(cfg.dns.cache_miss_ttl, DEFAULT_CACHE_MISS_TTL);
    }

    #[tokio::test]
    async fn test_invalid_subnet_reported() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("config/instance/ns1/network", "lab", None).await.unwrap();
        store.set("network/lab/subnet", "not-a-cidr", None).await.unwrap();

        let err = load_config(&store, &Identity::new("ns1")).await.unwrap_err();
        assert!(matches!(
            err,
            LoadError::Config(ConfigError::InvalidValue { field: "subnet", .. })
        ));
    }
}
