//! Reply options assembly.
//!
//! Starts from the effective binding's option set, applies the per-MAC
//! attribute overrides (an empty override removes the option, a non-empty
//! one replaces it), backfills the domain from the binding, and finally
//! filters to the client's Parameter Request List.

use dhcproto::v4::{DhcpOption, OptionCode};
use netcore_common::{AttrKey, AttrOverride, Binding};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// Assemble the full option set for a reply to `mac`'s effective binding.
pub fn assemble(binding: &Binding, server_ip: Ipv4Addr) -> BTreeMap<OptionCode, DhcpOption> {
    let mut options = BTreeMap::new();

    if let Some(subnet) = binding.subnet {
        insert(&mut options, DhcpOption::SubnetMask(subnet.netmask()));
    }
    if let Some(gateway) = binding.gateway {
        insert(&mut options, DhcpOption::Router(vec![gateway]));
    }
    insert(&mut options, DhcpOption::DomainNameServer(vec![server_ip]));
    if let Some(ntp) = binding.ntp {
        insert(&mut options, DhcpOption::NtpServers(vec![ntp]));
    }
    if let Some(tftp) = binding.tftp.as_deref().filter(|t| !t.is_empty()) {
        insert(
            &mut options,
            DhcpOption::TFTPServerName(tftp.as_bytes().to_vec()),
        );
    }

    for (key, value) in &binding.attrs {
        apply_override(&mut options, *key, value);
    }

    // Domain backfill: if no override set one, the binding's domain applies.
    if !options.contains_key(&OptionCode::DomainName) {
        if let Some(domain) = binding.domain.as_deref().filter(|d| !d.is_empty()) {
            insert(&mut options, DhcpOption::DomainName(domain.to_string()));
        }
    }

    options
}

fn insert(options: &mut BTreeMap<OptionCode, DhcpOption>, option: DhcpOption) {
    options.insert(OptionCode::from(&option), option);
}

fn apply_override(
    options: &mut BTreeMap<OptionCode, DhcpOption>,
    key: AttrKey,
    value: &AttrOverride,
) {
    let code = option_code(key);
    let text = match value {
        AttrOverride::Clear => {
            options.remove(&code);
            return;
        }
        AttrOverride::Value(text) => text,
    };

    let option = match key {
        AttrKey::Mask => parse_ip(key, text).map(DhcpOption::SubnetMask),
        AttrKey::Gateway => parse_ip(key, text).map(|ip| DhcpOption::Router(vec![ip])),
        AttrKey::Dns => parse_ip(key, text).map(|ip| DhcpOption::DomainNameServer(vec![ip])),
        AttrKey::Hostname => Some(DhcpOption::Hostname(text.clone())),
        AttrKey::Domain => Some(DhcpOption::DomainName(text.clone())),
        AttrKey::Broadcast => parse_ip(key, text).map(DhcpOption::BroadcastAddr),
        AttrKey::Ntp => parse_ip(key, text).map(|ip| DhcpOption::NtpServers(vec![ip])),
        AttrKey::Tftp => Some(DhcpOption::TFTPServerName(text.as_bytes().to_vec())),
    };
    if let Some(option) = option {
        options.insert(code, option);
    }
}

fn parse_ip(key: AttrKey, text: &str) -> Option<Ipv4Addr> {
    match text.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            debug!(attr = key.field(), value = text, "unparseable attribute override ignored");
            None
        }
    }
}

fn option_code(key: AttrKey) -> OptionCode {
    match key {
        AttrKey::Mask => OptionCode::SubnetMask,
        AttrKey::Gateway => OptionCode::Router,
        AttrKey::Dns => OptionCode::DomainNameServer,
        AttrKey::Hostname => OptionCode::Hostname,
        AttrKey::Domain => OptionCode::DomainName,
        AttrKey::Broadcast => OptionCode::BroadcastAddr,
        AttrKey::Ntp => OptionCode::NtpServers,
        AttrKey::Tftp => OptionCode::TFTPServerName,
    }
}

/// The assembled host name, used for DNS registration.
pub fn hostname(options: &BTreeMap<OptionCode, DhcpOption>) -> Option<&str> {
    match options.get(&OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// The assembled domain name, used for DNS registration.
pub fn domain(options: &BTreeMap<OptionCode, DhcpOption>) -> Option<&str> {
    match options.get(&OptionCode::DomainName) {
        Some(DhcpOption::DomainName(domain)) if !domain.is_empty() => Some(domain),
        _ => None,
    }
}

/// Select and order options by the client's Parameter Request List.
///
/// Without a list every assembled option is returned. Message type, server
/// identifier, and lease time never pass through here — the reply builder
/// owns those.
pub fn select_requested(
    options: BTreeMap<OptionCode, DhcpOption>,
    requested: Option<&[OptionCode]>,
) -> Vec<DhcpOption> {
    match requested {
        Some(codes) => {
            let mut options = options;
            codes.iter().filter_map(|code| options.remove(code)).collect()
        }
        None => options.into_values().collect(),
    }
}
