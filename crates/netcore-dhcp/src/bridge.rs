//! DHCP→DNS bridge.
//!
//! Granting a lease to a host with a known name publishes that name: a
//! forward A record under the FQDN and a reverse PTR under the address,
//! both with a TTL tied to the lease so they evaporate with it. Writes are
//! best-effort — a failed registration never blocks the DHCP reply.

use netcore_common::{names, MacAddr};
use netcore_store::Store;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::allocator::LEASE_TTL_PAD;

/// Registers forward and reverse records for granted leases.
#[derive(Clone)]
pub struct DnsBridge {
    store: Arc<dyn Store>,
}

impl DnsBridge {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Publish A and PTR records for a bound host.
    ///
    /// Skipped silently when the hostname or domain is unknown.
    pub async fn register(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        hostname: Option<&str>,
        domain: Option<&str>,
        lease_duration: Duration,
    ) {
        let Some(hostname) = hostname.filter(|h| !h.is_empty()) else {
            debug!(mac = %mac, "no hostname, skipping DNS registration");
            return;
        };
        let Some(domain) = domain.filter(|d| !d.is_empty()) else {
            debug!(mac = %mac, "no domain, skipping DNS registration");
            return;
        };

        let fqdn = names::fqdn_of(hostname, domain);
        let ttl = lease_duration + LEASE_TTL_PAD;

        let forward_key = format!(
            "{}/val/{}",
            names::rr_key(&fqdn, "a"),
            names::value_hash(&ip.to_string())
        );
        if let Err(e) = self.store.set(&forward_key, &ip.to_string(), Some(ttl)).await {
            warn!(fqdn = %fqdn, ip = %ip, error = %e, "forward record write failed");
        }

        let reverse_key = format!(
            "{}/@ptr/val/{}",
            names::reverse_key(ip),
            names::value_hash(&fqdn)
        );
        if let Err(e) = self.store.set(&reverse_key, &fqdn, Some(ttl)).await {
            warn!(fqdn = %fqdn, ip = %ip, error = %e, "reverse record write failed");
        }

        debug!(mac = %mac, fqdn = %fqdn, ip = %ip, "registered DNS records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_store::MemoryStore;

    fn mac() -> MacAddr {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_writes_forward_and_reverse() {
        let store = Arc::new(MemoryStore::new());
        let bridge = DnsBridge::new(store.clone());
        let ip: Ipv4Addr = "10.0.0.42".parse().unwrap();

        bridge
            .register(mac(), ip, Some("myhost"), Some("example.com"), Duration::from_secs(3600))
            .await;

        // sha1("10.0.0.42")
        let forward = store
            .get(
                "dns/com/example/myhost/@a/val/e4eed2dd435ca689334ba3ae2a51550197514a1e",
                false,
                false,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forward.value, "10.0.0.42");
        assert_eq!(forward.ttl, Some(3601));

        // sha1("myhost.example.com")
        let reverse = store
            .get(
                "dns/arpa/in-addr/10/0/0/42/@ptr/val/dc314c5f51d7fbeb78ad920d9ebd0c33d88cc8d8",
                false,
                false,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reverse.value, "myhost.example.com");
    }

    #[tokio::test]
    async fn test_register_requires_hostname_and_domain() {
        let store = Arc::new(MemoryStore::new());
        let bridge = DnsBridge::new(store.clone());
        let ip: Ipv4Addr = "10.0.0.42".parse().unwrap();

        bridge.register(mac(), ip, None, Some("example.com"), Duration::from_secs(60)).await;
        bridge.register(mac(), ip, Some("myhost"), None, Duration::from_secs(60)).await;
        bridge.register(mac(), ip, Some(""), Some("example.com"), Duration::from_secs(60)).await;

        assert!(store.get("dns", true, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_value_overwrites_same_key() {
        let store = Arc::new(MemoryStore::new());
        let bridge = DnsBridge::new(store.clone());
        let ip: Ipv4Addr = "10.0.0.42".parse().unwrap();

        bridge
            .register(mac(), ip, Some("myhost"), Some("example.com"), Duration::from_secs(60))
            .await;
        bridge
            .register(mac(), ip, Some("MYHOST"), Some("example.com"), Duration::from_secs(60))
            .await;

        let values = store
            .get("dns/com/example/myhost/@a/val", true, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(values.nodes.len(), 1);
    }
}
