//! Wake-on-LAN.
//!
//! A magic packet is 6 bytes of 0xFF followed by the target MAC repeated 16
//! times, sent to the broadcast address on UDP port 9. Hosts can be woken by
//! MAC directly, by leased IP (the lease record names the holder MAC), or by
//! hostname (forward A records name the IPs).

use netcore_common::{names, MacAddr};
use netcore_store::{Store, StoreError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

const WOL_PORT: u16 = 9;

/// Error type for wake operations. The display text doubles as the TXT
/// answer body when a wake is triggered over DNS.
#[derive(Debug, Error)]
pub enum WolError {
    #[error("not found")]
    NotFound,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WolError>;

/// Wake-on-LAN sender bound to one network's lease table.
pub struct WolService {
    store: Arc<dyn Store>,
    network: String,
}

impl WolService {
    pub fn new(store: Arc<dyn Store>, network: impl Into<String>) -> Self {
        Self {
            store,
            network: network.into(),
        }
    }

    /// Send a magic packet for the given MAC.
    pub async fn wake_by_mac(&self, mac: MacAddr) -> Result<()> {
        let packet = magic_packet(mac);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        socket
            .send_to(&packet, (Ipv4Addr::BROADCAST, WOL_PORT))
            .await?;
        info!(mac = %mac, "sent wake-on-LAN magic packet");
        Ok(())
    }

    /// Wake whichever MAC currently holds the lease for `ip`.
    pub async fn wake_by_ip(&self, ip: Ipv4Addr) -> Result<()> {
        let key = format!("network/{}/lease/{}", self.network, ip);
        let node = self
            .store
            .get(&key, false, false)
            .await?
            .ok_or(WolError::NotFound)?;
        let mac: MacAddr = node.value.parse().map_err(|_| WolError::NotFound)?;
        self.wake_by_mac(mac).await
    }

    /// Wake every host behind the forward A records of `hostname`.
    pub async fn wake_by_hostname(&self, hostname: &str) -> Result<()> {
        let key = format!("{}/val", names::rr_key(hostname, "a"));
        let node = self
            .store
            .get(&key, true, true)
            .await?
            .ok_or(WolError::NotFound)?;
        if node.nodes.is_empty() {
            return Err(WolError::NotFound);
        }
        let mut last = Ok(());
        for value in &node.nodes {
            debug!(hostname = %hostname, ip = %value.value, "waking address");
            match value.value.parse::<Ipv4Addr>() {
                Ok(ip) => last = self.wake_by_ip(ip).await,
                Err(_) => last = Err(WolError::NotFound),
            }
        }
        last
    }
}

/// Build the 102-byte magic packet for a MAC address.
fn magic_packet(mac: MacAddr) -> [u8; 102] {
    let mut packet = [0u8; 102];
    for byte in packet.iter_mut().take(6) {
        *byte = 0xFF;
    }
    let octets = mac.octets();
    for i in 0..16 {
        let offset = 6 + i * 6;
        packet[offset..offset + 6].copy_from_slice(&octets);
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_store::MemoryStore;

    #[test]
    fn test_magic_packet_format() {
        let mac: MacAddr = "11:22:33:44:55:66".parse().unwrap();
        let packet = magic_packet(mac);

        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[0..6], &[0xFF; 6]);
        for i in 0..16 {
            let offset = 6 + i * 6;
            assert_eq!(&packet[offset..offset + 6], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        }
    }

    #[tokio::test]
    async fn test_wake_by_ip_missing_lease() {
        let store = Arc::new(MemoryStore::new());
        let wol = WolService::new(store, "lab");
        let err = wol.wake_by_ip("10.0.0.99".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, WolError::NotFound));
        assert_eq!(err.to_string(), "not found");
    }

    #[tokio::test]
    async fn test_wake_by_hostname_missing_records() {
        let store = Arc::new(MemoryStore::new());
        let wol = WolService::new(store, "lab");
        let err = wol.wake_by_hostname("ghost.example.").await.unwrap_err();
        assert!(matches!(err, WolError::NotFound));
    }
}
