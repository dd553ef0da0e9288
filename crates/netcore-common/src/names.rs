//! DNS name ↔ store key derivation.
//!
//! Records live under slash-delimited keys with the labels reversed, so an
//! entire zone shares a subtree: `a.b.example.` → `dns/example/b/a`. Reverse
//! lookups for `w.x.y.z` live under `dns/arpa/in-addr/w/x/y/z`. Record
//! values are content-hashed with SHA-1 so equal values collapse onto equal
//! keys.

use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;

/// Store key root for a fully qualified name (no record-type suffix).
pub fn dns_key(fqdn: &str) -> String {
    let mut labels: Vec<&str> = fqdn
        .trim_end_matches('.')
        .split('.')
        .filter(|l| !l.is_empty())
        .collect();
    labels.reverse();
    format!("dns/{}", labels.join("/")).to_lowercase()
}

/// Store key for one record type at a name, e.g. `dns/example/www/@a`.
pub fn rr_key(fqdn: &str, rtype: &str) -> String {
    format!("{}/@{}", dns_key(fqdn), rtype.to_lowercase())
}

/// Store key root for the PTR subtree of an IPv4 address.
///
/// The octets appear in network order because the reversed form of
/// `z.y.x.w.in-addr.arpa.` is `arpa/in-addr/w/x/y/z`.
pub fn reverse_key(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("dns/arpa/in-addr/{}/{}/{}/{}", o[0], o[1], o[2], o[3])
}

/// Lowercase hex SHA-1 of a record value, used as its key segment.
pub fn value_hash(value: &str) -> String {
    let digest = Sha1::digest(value.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Normalize a domain name to have exactly one trailing dot.
pub fn ensure_trailing_dot(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// Join a hostname and domain into a lowercase FQDN without a trailing dot.
pub fn fqdn_of(hostname: &str, domain: &str) -> String {
    format!("{hostname}.{domain}")
        .to_lowercase()
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_key_reverses_labels() {
        assert_eq!(dns_key("a.b.c.example."), "dns/example/c/b/a");
        assert_eq!(dns_key("example"), "dns/example");
        assert_eq!(dns_key("WWW.Example.com"), "dns/com/example/www");
    }

    #[test]
    fn test_rr_key() {
        assert_eq!(rr_key("www.example.", "A"), "dns/example/www/@a");
        assert_eq!(rr_key("example.", "SOA"), "dns/example/@soa");
    }

    #[test]
    fn test_reverse_key_network_order() {
        let ip: Ipv4Addr = "10.0.0.42".parse().unwrap();
        assert_eq!(reverse_key(ip), "dns/arpa/in-addr/10/0/0/42");
    }

    #[test]
    fn test_value_hash_is_sha1_hex() {
        // Known digest: sha1("10.0.0.2")
        assert_eq!(value_hash("10.0.0.2"), "5ab187e3bc6375b95a0250f2d8c66723de97dcb9");
        assert_eq!(value_hash("10.0.0.2").len(), 40);
        assert_eq!(value_hash("a"), value_hash("a"));
        assert_ne!(value_hash("a"), value_hash("b"));
    }

    #[test]
    fn test_ensure_trailing_dot() {
        assert_eq!(ensure_trailing_dot("example.com"), "example.com.");
        assert_eq!(ensure_trailing_dot("example.com."), "example.com.");
    }

    #[test]
    fn test_fqdn_of() {
        assert_eq!(fqdn_of("Host", "Example.COM."), "host.example.com");
    }
}
