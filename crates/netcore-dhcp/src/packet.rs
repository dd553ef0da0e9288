//! DHCP packet translation.
//!
//! Wraps the wire library: inbound packets are parsed into a [`DhcpRequest`]
//! with the fields the state machine cares about pulled out of the options,
//! and replies are assembled with [`ReplyBuilder`] following the RFC 2131
//! field-copy rules.

use crate::error::{DhcpError, Result};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use netcore_common::MacAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Parsed DHCP request with extracted information.
#[derive(Debug, Clone)]
pub struct DhcpRequest {
    /// Original message.
    pub message: Message,

    /// Message type (DISCOVER, REQUEST, etc.).
    pub message_type: MessageType,

    /// Client MAC address.
    pub mac: MacAddr,

    /// Transaction ID.
    pub xid: u32,

    /// Client IP (`ciaddr`).
    pub client_ip: Ipv4Addr,

    /// Server IP the client is answering (`siaddr`).
    pub server_ip: Ipv4Addr,

    /// Relay agent IP (`giaddr`).
    pub relay_ip: Ipv4Addr,

    /// Requested IP address (option 50).
    pub requested_ip: Option<Ipv4Addr>,

    /// Requested lease time in seconds (option 51).
    pub requested_lease: Option<u32>,

    /// Client-supplied host name (option 12).
    pub hostname: Option<String>,

    /// Parameter request list (option 55).
    pub param_request_list: Option<Vec<OptionCode>>,
}

impl DhcpRequest {
    /// Parse a DHCP request from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message =
            Message::from_bytes(data).map_err(|e| DhcpError::ParseError(e.to_string()))?;

        let message_type = message
            .opts()
            .get(OptionCode::MessageType)
            .and_then(|opt| {
                if let DhcpOption::MessageType(mt) = opt {
                    Some(*mt)
                } else {
                    None
                }
            })
            .ok_or_else(|| DhcpError::ParseError("missing message type".to_string()))?;

        let mac = MacAddr::from_chaddr(message.chaddr())
            .ok_or_else(|| DhcpError::ParseError("short chaddr".to_string()))?;

        let requested_ip = message.opts().get(OptionCode::RequestedIpAddress).and_then(|opt| {
            if let DhcpOption::RequestedIpAddress(ip) = opt {
                Some(*ip)
            } else {
                None
            }
        });

        let requested_lease = message.opts().get(OptionCode::AddressLeaseTime).and_then(|opt| {
            if let DhcpOption::AddressLeaseTime(secs) = opt {
                Some(*secs)
            } else {
                None
            }
        });

        let hostname = message.opts().get(OptionCode::Hostname).and_then(|opt| {
            if let DhcpOption::Hostname(name) = opt {
                Some(name.clone())
            } else {
                None
            }
        });

        let param_request_list =
            message.opts().get(OptionCode::ParameterRequestList).and_then(|opt| {
                if let DhcpOption::ParameterRequestList(codes) = opt {
                    Some(codes.clone())
                } else {
                    None
                }
            });

        Ok(Self {
            xid: message.xid(),
            client_ip: message.ciaddr(),
            server_ip: message.siaddr(),
            relay_ip: message.giaddr(),
            message_type,
            mac,
            requested_ip,
            requested_lease,
            hostname,
            param_request_list,
            message,
        })
    }
}

/// DHCP reply builder.
pub struct ReplyBuilder {
    request: DhcpRequest,
    message_type: MessageType,
    server_ip: Ipv4Addr,
    yiaddr: Option<Ipv4Addr>,
    lease_duration: Option<Duration>,
    copy_ciaddr: bool,
    options: Vec<DhcpOption>,
}

impl ReplyBuilder {
    pub fn new(request: DhcpRequest, message_type: MessageType, server_ip: Ipv4Addr) -> Self {
        Self {
            request,
            message_type,
            server_ip,
            yiaddr: None,
            lease_duration: None,
            copy_ciaddr: false,
            options: Vec::new(),
        }
    }

    /// Set the offered address (`yiaddr`).
    pub fn with_yiaddr(mut self, ip: Ipv4Addr) -> Self {
        self.yiaddr = Some(ip);
        self
    }

    /// Set the granted lease duration (option 51).
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    /// Copy `ciaddr` from the request, as an Inform reply must.
    pub fn with_ciaddr_copied(mut self) -> Self {
        self.copy_ciaddr = true;
        self
    }

    /// Attach pre-assembled reply options.
    pub fn with_options(mut self, options: Vec<DhcpOption>) -> Self {
        self.options = options;
        self
    }

    /// Build the reply message.
    pub fn build(self) -> Message {
        let mut reply = Message::default();

        reply.set_opcode(Opcode::BootReply);
        reply.set_xid(self.request.xid);
        reply.set_flags(self.request.message.flags());
        reply.set_chaddr(self.request.message.chaddr());
        reply.set_giaddr(self.request.relay_ip);

        if self.copy_ciaddr {
            reply.set_ciaddr(self.request.client_ip);
        }
        if let Some(ip) = self.yiaddr {
            reply.set_yiaddr(ip);
        }
        reply.set_siaddr(self.server_ip);

        reply
            .opts_mut()
            .insert(DhcpOption::MessageType(self.message_type));
        reply
            .opts_mut()
            .insert(DhcpOption::ServerIdentifier(self.server_ip));

        if let Some(duration) = self.lease_duration {
            reply
                .opts_mut()
                .insert(DhcpOption::AddressLeaseTime(duration.as_secs() as u32));
        }

        for option in self.options {
            reply.opts_mut().insert(option);
        }

        reply
    }

    /// Build and encode the reply to bytes.
    pub fn build_bytes(self) -> Result<Vec<u8>> {
        self.build()
            .to_vec()
            .map_err(|e| DhcpError::EncodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover_message(mac: [u8; 6]) -> Message {
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest);
        msg.set_xid(0x12345678);
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        msg.set_chaddr(&chaddr);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        msg
    }

    #[test]
    fn test_parse_discover() {
        let msg = discover_message([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let bytes = msg.to_vec().unwrap();
        let request = DhcpRequest::parse(&bytes).unwrap();

        assert_eq!(request.message_type, MessageType::Discover);
        assert_eq!(request.mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(request.xid, 0x12345678);
        assert!(request.requested_ip.is_none());
        assert!(request.requested_lease.is_none());
    }

    #[test]
    fn test_parse_request_options() {
        let mut msg = discover_message([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Request));
        msg.opts_mut()
            .insert(DhcpOption::RequestedIpAddress("10.0.0.2".parse().unwrap()));
        msg.opts_mut().insert(DhcpOption::AddressLeaseTime(7200));
        msg.opts_mut()
            .insert(DhcpOption::Hostname("workstation".to_string()));
        msg.opts_mut().insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
        ]));

        let request = DhcpRequest::parse(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(request.message_type, MessageType::Request);
        assert_eq!(request.requested_ip, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(request.requested_lease, Some(7200));
        assert_eq!(request.hostname.as_deref(), Some("workstation"));
        assert_eq!(
            request.param_request_list.as_deref(),
            Some(&[OptionCode::SubnetMask, OptionCode::Router][..])
        );
    }

    #[test]
    fn test_parse_rejects_missing_message_type() {
        // A BOOTP-style message without option 53.
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest);
        msg.set_xid(0x1);
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        msg.set_chaddr(&chaddr);
        let bytes = msg.to_vec().unwrap();
        assert!(DhcpRequest::parse(&bytes).is_err());
    }

    #[test]
    fn test_build_offer() {
        let msg = discover_message([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let request = DhcpRequest::parse(&msg.to_vec().unwrap()).unwrap();

        let reply = ReplyBuilder::new(request, MessageType::Offer, "10.0.0.1".parse().unwrap())
            .with_yiaddr("10.0.0.2".parse().unwrap())
            .with_lease_duration(Duration::from_secs(3600))
            .build();

        assert_eq!(reply.opcode(), Opcode::BootReply);
        assert_eq!(reply.xid(), 0x12345678);
        assert_eq!(reply.yiaddr(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(reply.siaddr(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            reply.opts().get(OptionCode::MessageType),
            Some(&DhcpOption::MessageType(MessageType::Offer))
        );
        assert_eq!(
            reply.opts().get(OptionCode::AddressLeaseTime),
            Some(&DhcpOption::AddressLeaseTime(3600))
        );
    }

    #[test]
    fn test_build_nak_has_no_yiaddr() {
        let msg = discover_message([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let request = DhcpRequest::parse(&msg.to_vec().unwrap()).unwrap();

        let reply = ReplyBuilder::new(request, MessageType::Nak, "10.0.0.1".parse().unwrap())
            .build();

        assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
        assert!(reply.opts().get(OptionCode::AddressLeaseTime).is_none());
    }

    #[test]
    fn test_inform_reply_copies_ciaddr() {
        let mut msg = discover_message([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Inform));
        msg.set_ciaddr("10.0.0.7".parse::<Ipv4Addr>().unwrap());
        let request = DhcpRequest::parse(&msg.to_vec().unwrap()).unwrap();

        let reply = ReplyBuilder::new(request, MessageType::Ack, "10.0.0.1".parse().unwrap())
            .with_ciaddr_copied()
            .build();

        assert_eq!(reply.ciaddr(), "10.0.0.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
    }
}
