//! netcore DHCP service.
//!
//! A DHCPv4 server whose only state is the shared store: address selection
//! consults reservations and remembered assignments, leases are claimed with
//! the store's atomic create and renewed with compare-and-swap, and every
//! granted lease with a known hostname publishes forward and reverse DNS
//! records as a side effect.
//!
//! The engine itself is transport-free; [`DhcpServer`] supplies the UDP/67
//! broadcast listener.

pub mod allocator;
pub mod binding;
pub mod bridge;
pub mod engine;
pub mod error;
pub mod options;
pub mod packet;
pub mod server;

pub use allocator::{Allocator, LeaseInfo, LEASE_TTL_PAD};
pub use binding::effective_binding;
pub use bridge::DnsBridge;
pub use engine::{DhcpConfig, DhcpService, MINIMUM_LEASE_DURATION};
pub use error::{DhcpError, Result};
pub use packet::{DhcpRequest, ReplyBuilder};
pub use server::DhcpServer;
