//! The DHCP request state machine.
//!
//! One entry point: [`DhcpService::handle`] translates an inbound message
//! into a reply, or into silence. The engine keeps no state of its own —
//! every decision routes through the shared store, so any instance on the
//! network can answer any client.
//!
//! Failure policy: a store read error yields no reply (the client retries),
//! while a failed atomic create or compare-and-swap during Request is a NAK
//! — someone else won the address.

use dhcproto::v4::{Message, MessageType};
use ipnet::Ipv4Net;
use netcore_common::{Binding, MacAddr};
use netcore_store::Store;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::allocator::Allocator;
use crate::binding::{effective_binding, mac_entry_exists};
use crate::bridge::DnsBridge;
use crate::options;
use crate::packet::{DhcpRequest, ReplyBuilder};

/// Shortest lease the server will grant, regardless of what was asked for.
pub const MINIMUM_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Static configuration for one DHCP service instance.
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    /// IP the service answers from (server identifier, DNS option).
    pub server_ip: Ipv4Addr,
    /// NIC the listener binds to.
    pub nic: String,
    /// The network's subnet; requests for addresses outside it are NAKed.
    pub subnet: Ipv4Net,
    /// The guest pool dynamic addresses are drawn from.
    pub pool: Ipv4Net,
    /// Base binding merged from the global, network, and instance scopes.
    pub binding: Binding,
}

/// The DHCP engine for one network.
pub struct DhcpService {
    store: Arc<dyn Store>,
    network: String,
    config: DhcpConfig,
    allocator: Allocator,
    bridge: DnsBridge,
}

impl DhcpService {
    pub fn new(store: Arc<dyn Store>, network: impl Into<String>, config: DhcpConfig) -> Self {
        let network = network.into();
        Self {
            allocator: Allocator::new(store.clone(), network.clone()),
            bridge: DnsBridge::new(store.clone()),
            store,
            network,
            config,
        }
    }

    pub fn config(&self) -> &DhcpConfig {
        &self.config
    }

    /// Handle one inbound message. `None` means no reply is sent.
    pub async fn handle(&self, request: DhcpRequest) -> Option<Message> {
        match request.message_type {
            MessageType::Discover => self.handle_discover(request).await,
            MessageType::Request => self.handle_request(request).await,
            MessageType::Decline => {
                // RFC 2131 4.3.3. Lease revocation is future work.
                info!(mac = %request.mac, "DHCP Decline");
                None
            }
            MessageType::Release => {
                // RFC 2131 4.3.4. Lease revocation is future work.
                info!(mac = %request.mac, "DHCP Release");
                None
            }
            MessageType::Inform => self.handle_inform(request).await,
            other => {
                debug!(mac = %request.mac, msg_type = ?other, "ignoring message type");
                None
            }
        }
    }

    /// RFC 2131 4.3.1.
    async fn handle_discover(&self, request: DhcpRequest) -> Option<Message> {
        let mac = request.mac;
        if !self.is_permitted(mac) {
            info!(mac = %mac, "DHCP Discover from unpermitted MAC");
            return None;
        }

        let binding = match effective_binding(&self.store, &self.network, &self.config.binding, mac)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!(mac = %mac, error = %e, "binding lookup failed, no reply");
                return None;
            }
        };
        let configured = binding.effective_lease_duration();

        // An unexpired lease for this MAC is always re-offered.
        match self.allocator.lookup_by_mac(mac).await {
            Ok(Some(lease)) => {
                let duration = self.negotiate_duration(
                    request.requested_lease,
                    lease.remaining.unwrap_or(configured),
                    configured,
                );
                info!(mac = %mac, ip = %lease.ip, "DHCP Discover (offering current lease)");
                return Some(self.offer(request, lease.ip, duration, &binding));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(mac = %mac, error = %e, "lease lookup failed, no reply");
                return None;
            }
        }

        let selected = match self
            .allocator
            .select(&binding, self.config.pool, mac, &self.exclusions(&binding))
            .await
        {
            Ok(ip) => ip,
            Err(e) => {
                warn!(mac = %mac, error = %e, "address selection failed, no reply");
                return None;
            }
        };

        match selected {
            Some(ip) => {
                let duration =
                    self.negotiate_duration(request.requested_lease, configured, configured);
                info!(mac = %mac, ip = %ip, "DHCP Discover (offering from pool)");
                Some(self.offer(request, ip, duration, &binding))
            }
            None => {
                warn!(mac = %mac, "DHCP Discover (no addresses available in pool)");
                None
            }
        }
    }

    /// RFC 2131 4.3.2.
    async fn handle_request(&self, request: DhcpRequest) -> Option<Message> {
        let mac = request.mac;
        if !self.is_permitted(mac) {
            info!(mac = %mac, "DHCP Request from unpermitted MAC");
            return None;
        }

        let (state, requested_ip) = request_state(&request);
        let Some(requested_ip) = requested_ip else {
            info!(mac = %mac, state, "DHCP Request without an address, ignoring");
            return None;
        };

        if !self.config.subnet.contains(&requested_ip) {
            info!(mac = %mac, state, ip = %requested_ip, "DHCP Request outside subnet, NAK");
            return Some(self.nak(request));
        }

        // A Request answering another server's Offer is not ours to answer.
        if !request.server_ip.is_unspecified() && request.server_ip != self.config.server_ip {
            info!(
                mac = %mac,
                state,
                server = %request.server_ip,
                "DHCP Request answers another server"
            );
            return None;
        }

        let binding = match effective_binding(&self.store, &self.network, &self.config.binding, mac)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!(mac = %mac, error = %e, "binding lookup failed, no reply");
                return None;
            }
        };
        let configured = binding.effective_lease_duration();
        let duration = self.negotiate_duration(request.requested_lease, configured, configured);

        let existing = match self.allocator.lookup_by_mac(mac).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(mac = %mac, error = %e, "lease lookup failed, no reply");
                return None;
            }
        };

        let granted = match existing {
            Some(lease) if lease.ip == requested_ip => {
                match self.allocator.renew_lease(requested_ip, mac, duration).await {
                    Ok(true) => true,
                    Ok(false) => false,
                    Err(e) => {
                        warn!(mac = %mac, error = %e, "lease renewal failed, no reply");
                        return None;
                    }
                }
            }
            Some(lease) => {
                info!(
                    mac = %mac,
                    state,
                    ip = %requested_ip,
                    held = %lease.ip,
                    "DHCP Request for a different address than leased, NAK"
                );
                return Some(self.nak(request));
            }
            None => {
                // Fresh claims must come from the guest pool; addresses
                // outside it are handed out administratively.
                if !self.config.pool.contains(&requested_ip) {
                    info!(mac = %mac, state, ip = %requested_ip, "DHCP Request outside pool, NAK");
                    return Some(self.nak(request));
                }
                match self.allocator.create_lease(requested_ip, mac, duration).await {
                    Ok(created) => created,
                    Err(e) => {
                        warn!(mac = %mac, error = %e, "lease creation failed, no reply");
                        return None;
                    }
                }
            }
        };

        if !granted {
            info!(mac = %mac, state, ip = %requested_ip, "DHCP Request lost the address, NAK");
            return Some(self.nak(request));
        }

        let opts = options::assemble(&binding, self.config.server_ip);
        let hostname = options::hostname(&opts).or(request.hostname.as_deref());
        let domain = options::domain(&opts);
        self.bridge
            .register(mac, requested_ip, hostname, domain, duration)
            .await;

        info!(mac = %mac, state, ip = %requested_ip, secs = duration.as_secs(), "DHCP ACK");
        let selected = options::select_requested(opts, request.param_request_list.clone().as_deref());
        Some(
            ReplyBuilder::new(request, MessageType::Ack, self.config.server_ip)
                .with_yiaddr(requested_ip)
                .with_lease_duration(duration)
                .with_options(selected)
                .build(),
        )
    }

    /// RFC 2131 4.3.5: options only, no address assignment.
    async fn handle_inform(&self, request: DhcpRequest) -> Option<Message> {
        let mac = request.mac;
        let ip = request.client_ip;
        if ip.is_unspecified() || !self.config.pool.contains(&ip) {
            return None;
        }

        match mac_entry_exists(&self.store, &self.network, mac).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(mac = %mac, "DHCP Inform from unknown MAC, ignoring");
                return None;
            }
            Err(e) => {
                warn!(mac = %mac, error = %e, "MAC lookup failed, no reply");
                return None;
            }
        }

        let binding = match effective_binding(&self.store, &self.network, &self.config.binding, mac)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!(mac = %mac, error = %e, "binding lookup failed, no reply");
                return None;
            }
        };

        info!(mac = %mac, ip = %ip, "DHCP Inform ACK");
        let opts = options::assemble(&binding, self.config.server_ip);
        let selected = options::select_requested(opts, request.param_request_list.clone().as_deref());
        Some(
            ReplyBuilder::new(request, MessageType::Ack, self.config.server_ip)
                .with_ciaddr_copied()
                .with_options(selected)
                .build(),
        )
    }

    fn offer(
        &self,
        request: DhcpRequest,
        ip: Ipv4Addr,
        duration: Duration,
        binding: &Binding,
    ) -> Message {
        let opts = options::assemble(binding, self.config.server_ip);
        let selected = options::select_requested(opts, request.param_request_list.clone().as_deref());
        ReplyBuilder::new(request, MessageType::Offer, self.config.server_ip)
            .with_yiaddr(ip)
            .with_lease_duration(duration)
            .with_options(selected)
            .build()
    }

    fn nak(&self, request: DhcpRequest) -> Message {
        ReplyBuilder::new(request, MessageType::Nak, self.config.server_ip).build()
    }

    fn is_permitted(&self, _mac: MacAddr) -> bool {
        // Current policy: permit all hardware.
        true
    }

    fn exclusions(&self, binding: &Binding) -> Vec<Ipv4Addr> {
        let mut exclude = vec![self.config.server_ip];
        if let Some(gateway) = binding.gateway {
            exclude.push(gateway);
        }
        exclude
    }

    /// Lease duration negotiation.
    ///
    /// A requested duration (option 51) is clamped to the policy window;
    /// otherwise the supplied default applies (the remaining time of an
    /// existing lease, or the configured duration for a fresh one). The
    /// result never drops below the policy minimum.
    fn negotiate_duration(
        &self,
        requested: Option<u32>,
        default: Duration,
        maximum: Duration,
    ) -> Duration {
        let duration = match requested {
            Some(secs) => Duration::from_secs(u64::from(secs)).min(maximum),
            None => default,
        };
        duration.max(MINIMUM_LEASE_DURATION)
    }
}

fn request_state(request: &DhcpRequest) -> (&'static str, Option<Ipv4Addr>) {
    match request.requested_ip {
        Some(ip) if !ip.is_unspecified() => ("NEW", Some(ip)),
        Some(_) => ("NEW", None),
        None if request.client_ip.is_unspecified() => ("RENEWAL", None),
        None => ("RENEWAL", Some(request.client_ip)),
    }
}
