//! Error types for the DHCP service.

use std::net::SocketAddr;
use thiserror::Error;

/// Error type for DHCP operations.
#[derive(Debug, Error)]
pub enum DhcpError {
    /// Failed to bind the listening socket.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse an inbound DHCP packet.
    #[error("failed to parse DHCP packet: {0}")]
    ParseError(String),

    /// Failed to encode a reply packet.
    #[error("failed to encode DHCP packet: {0}")]
    EncodeError(String),

    /// Socket send/receive error.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] netcore_store::StoreError),
}

/// Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, DhcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DhcpError::ParseError("missing message type".to_string());
        assert_eq!(err.to_string(), "failed to parse DHCP packet: missing message type");

        let addr: SocketAddr = "0.0.0.0:67".parse().unwrap();
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = DhcpError::BindFailed { addr, source: io_err };
        assert!(err.to_string().contains("failed to bind to 0.0.0.0:67"));
    }
}
