//! DHCP listener.
//!
//! Binds UDP/67 on the configured NIC with broadcast reception and feeds
//! packets through the engine one at a time. Undecodable packets are
//! dropped with a log; reply encoding failures are fatal for the listener
//! task and surface through its completion.

use crate::engine::DhcpService;
use crate::error::{DhcpError, Result};
use crate::packet::DhcpRequest;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// UDP front end for the DHCP engine.
pub struct DhcpServer {
    service: Arc<DhcpService>,
}

impl DhcpServer {
    pub fn new(service: DhcpService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    /// Run the listener until shutdown is signalled or a fatal error occurs.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let nic = self.service.config().nic.clone();
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        let socket = create_socket(bind_addr, &nic)?;

        info!(addr = %bind_addr, nic = %nic, "DHCP server listening");

        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    if let Err(e) = self.handle_packet(&socket, &buf[..len], src).await {
                        return Err(e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCP server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, socket: &UdpSocket, data: &[u8], src: SocketAddr) -> Result<()> {
        let request = match DhcpRequest::parse(data) {
            Ok(req) => req,
            Err(e) => {
                debug!(src = %src, error = %e, "dropping undecodable DHCP packet");
                return Ok(());
            }
        };

        debug!(
            mac = %request.mac,
            msg_type = ?request.message_type,
            src = %src,
            "received DHCP packet"
        );

        let relay_ip = request.relay_ip;
        let client_ip = request.client_ip;
        let Some(reply) = self.service.handle(request).await else {
            return Ok(());
        };

        let dest = if !relay_ip.is_unspecified() {
            SocketAddr::new(relay_ip.into(), DHCP_SERVER_PORT)
        } else if !client_ip.is_unspecified() {
            SocketAddr::new(client_ip.into(), DHCP_CLIENT_PORT)
        } else {
            SocketAddr::new(Ipv4Addr::BROADCAST.into(), DHCP_CLIENT_PORT)
        };

        let bytes = dhcproto::Encodable::to_vec(&reply)
            .map_err(|e| DhcpError::EncodeError(e.to_string()))?;
        if let Err(e) = socket.send_to(&bytes, dest).await {
            error!(dest = %dest, error = %e, "failed to send DHCP reply");
        }
        Ok(())
    }
}

/// Create the broadcast-capable listening socket bound to one NIC.
fn create_socket(bind_addr: SocketAddrV4, nic: &str) -> Result<UdpSocket> {
    let map_err = |source: std::io::Error| DhcpError::BindFailed {
        addr: bind_addr.into(),
        source,
    };

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(map_err)?;

    socket.set_reuse_address(true).ok();
    socket.set_broadcast(true).map_err(map_err)?;

    #[cfg(target_os = "linux")]
    if !nic.is_empty() {
        socket.bind_device(Some(nic.as_bytes())).map_err(map_err)?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = nic;

    socket.bind(&bind_addr.into()).map_err(map_err)?;
    socket.set_nonblocking(true).map_err(map_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(map_err)
}
