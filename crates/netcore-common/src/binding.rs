//! Configuration layering.
//!
//! Effective configuration is composed from global, instance, network,
//! MAC-prefix, type, device, and MAC scopes. Each scope contributes a patch
//! in which every field is optional; folding the patches in layer order
//! yields the effective value, and an absent field never overwrites an
//! earlier one.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default lease duration applied when no layer specifies one.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(12 * 60 * 60);

/// How an address is bound to a MAC.
///
/// Reserved assignments are operator-created and survive lease expiration;
/// dynamic assignments only matter while their lease is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMode {
    Reserved,
    Dynamic,
}

impl AssignmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Dynamic => "dynamic",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reserved" => Some(Self::Reserved),
            "dynamic" => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// An IP address assigned to a MAC, reserved or remembered from a past lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub mode: AssignmentMode,
    pub priority: i32,
    pub created: DateTime<Utc>,
    pub assigned: DateTime<Utc>,
    pub address: Ipv4Addr,
}

/// Sort assignments into allocation preference order: reserved before
/// dynamic, higher priority first, most recently assigned first. Ties break
/// on address so the order is total.
pub fn sort_assignments(assignments: &mut [Assignment]) {
    assignments.sort_by(|a, b| {
        a.mode
            .cmp(&b.mode)
            .then(b.priority.cmp(&a.priority))
            .then(b.assigned.cmp(&a.assigned))
            .then(a.address.cmp(&b.address))
    });
}

/// The closed set of per-MAC attribute keys that map onto DHCP options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrKey {
    /// Subnet mask (`mask`).
    Mask,
    /// Router (`gw`).
    Gateway,
    /// Name server (`ns`).
    Dns,
    /// Host name (`name`).
    Hostname,
    /// Domain name (`domain`).
    Domain,
    /// Broadcast address (`broadcast`).
    Broadcast,
    /// NTP server (`ntp`).
    Ntp,
    /// TFTP server name (`tftp`).
    Tftp,
}

impl AttrKey {
    pub const ALL: [AttrKey; 8] = [
        AttrKey::Mask,
        AttrKey::Gateway,
        AttrKey::Dns,
        AttrKey::Hostname,
        AttrKey::Domain,
        AttrKey::Broadcast,
        AttrKey::Ntp,
        AttrKey::Tftp,
    ];

    /// The store field name under an `attr/` directory.
    pub fn field(&self) -> &'static str {
        match self {
            Self::Mask => "mask",
            Self::Gateway => "gw",
            Self::Dns => "ns",
            Self::Hostname => "name",
            Self::Domain => "domain",
            Self::Broadcast => "broadcast",
            Self::Ntp => "ntp",
            Self::Tftp => "tftp",
        }
    }

    pub fn from_field(field: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.field() == field)
    }
}

/// A per-MAC attribute override.
///
/// A stored empty string is an explicit unset signal: it removes the option
/// from the reply rather than leaving the inherited value in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrOverride {
    Clear,
    Value(String),
}

impl AttrOverride {
    pub fn from_stored(value: &str) -> Self {
        if value.is_empty() {
            Self::Clear
        } else {
            Self::Value(value.to_string())
        }
    }
}

/// One scope's contribution to the effective binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingPatch {
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub domain: Option<String>,
    pub tftp: Option<String>,
    pub ntp: Option<Ipv4Addr>,
    pub pool: Option<Ipv4Net>,
    pub lease_duration: Option<Duration>,
    pub assignments: Vec<Assignment>,
    pub attrs: BTreeMap<AttrKey, AttrOverride>,
}

/// The effective DHCP attributes for one MAC on one network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binding {
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub domain: Option<String>,
    pub tftp: Option<String>,
    pub ntp: Option<Ipv4Addr>,
    pub pool: Option<Ipv4Net>,
    pub lease_duration: Option<Duration>,
    pub assignments: Vec<Assignment>,
    pub attrs: BTreeMap<AttrKey, AttrOverride>,
}

impl Binding {
    /// Apply one more layer. Present fields overwrite, absent fields never
    /// do; assignments accumulate and attribute overrides merge per key.
    pub fn overlay(&mut self, patch: BindingPatch) {
        if patch.subnet.is_some() {
            self.subnet = patch.subnet;
        }
        if patch.gateway.is_some() {
            self.gateway = patch.gateway;
        }
        if patch.domain.is_some() {
            self.domain = patch.domain;
        }
        if patch.tftp.is_some() {
            self.tftp = patch.tftp;
        }
        if patch.ntp.is_some() {
            self.ntp = patch.ntp;
        }
        if patch.pool.is_some() {
            self.pool = patch.pool;
        }
        if patch.lease_duration.is_some() {
            self.lease_duration = patch.lease_duration;
        }
        self.assignments.extend(patch.assignments);
        self.attrs.extend(patch.attrs);
    }

    /// Fold a sequence of patches in layer order.
    pub fn merge(patches: impl IntoIterator<Item = BindingPatch>) -> Self {
        let mut binding = Binding::default();
        for patch in patches {
            binding.overlay(patch);
        }
        binding
    }

    pub fn effective_lease_duration(&self) -> Duration {
        self.lease_duration.unwrap_or(DEFAULT_LEASE_DURATION)
    }

    /// A binding must name a gateway and a subnet before it can back leases.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.is_none() {
            return Err(ConfigError::NoLeaseGateway);
        }
        if self.subnet.is_none() {
            return Err(ConfigError::NoLeaseSubnet);
        }
        Ok(())
    }
}

/// One scope's contribution to the server-side configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerPatch {
    pub network: Option<String>,
    pub nic: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Net>,
    pub enabled: Option<bool>,
}

/// Effective server-side configuration: where this instance listens.
///
/// Composed from the global, instance, and network scopes only — hardware
/// scopes never influence where the server binds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    pub network: Option<String>,
    pub nic: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Net>,
    pub enabled: bool,
}

impl ServerConfig {
    pub fn overlay(&mut self, patch: ServerPatch) {
        if patch.network.is_some() {
            self.network = patch.network;
        }
        if patch.nic.is_some() {
            self.nic = patch.nic;
        }
        if patch.ip.is_some() {
            self.ip = patch.ip;
        }
        if patch.subnet.is_some() {
            self.subnet = patch.subnet;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
    }

    pub fn merge(patches: impl IntoIterator<Item = ServerPatch>) -> Self {
        let mut cfg = ServerConfig {
            enabled: true,
            ..Default::default()
        };
        for patch in patches {
            cfg.overlay(patch);
        }
        cfg
    }

    /// Validate the fields every DHCP instance needs before binding a socket.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.is_none() {
            return Err(ConfigError::NoConfigNetwork);
        }
        if self.subnet.is_none() {
            return Err(ConfigError::NoConfigSubnet);
        }
        if self.ip.is_none() {
            return Err(ConfigError::NoConfigIP);
        }
        if self.nic.is_none() {
            return Err(ConfigError::NoConfigNIC);
        }
        Ok(())
    }
}
