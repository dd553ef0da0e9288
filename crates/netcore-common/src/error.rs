//! Configuration validation errors.

use thiserror::Error;

/// Error raised when the merged configuration is unusable.
///
/// These are fatal at startup: the supervisor reports them and exits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No network id was selected by any configuration layer.
    #[error("network not specified in configuration")]
    NoConfigNetwork,

    /// The server subnet is missing from the merged configuration.
    #[error("subnet not specified in configuration")]
    NoConfigSubnet,

    /// The DHCP listen IP is missing from the merged configuration.
    #[error("IP not specified in configuration")]
    NoConfigIP,

    /// The DHCP NIC is missing from the merged configuration.
    #[error("NIC not specified in configuration")]
    NoConfigNIC,

    /// The effective binding has no gateway to hand to clients.
    #[error("a gateway has not been specified for the lease")]
    NoLeaseGateway,

    /// The effective binding has no subnet to hand to clients.
    #[error("a subnet has not been specified for the lease")]
    NoLeaseSubnet,

    /// A stored configuration value could not be parsed.
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}
