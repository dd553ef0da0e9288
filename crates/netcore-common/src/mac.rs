//! MAC address handling.
//!
//! The store keys hardware configuration by MAC string, and prefix scopes
//! inherit attributes down to longer matches, so the address type needs a
//! canonical text form and a prefix iterator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit hardware address in canonical lowercase colon form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Parse from the first six bytes of a DHCP `chaddr` field.
    pub fn from_chaddr(chaddr: &[u8]) -> Option<Self> {
        if chaddr.len() < 6 {
            return None;
        }
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&chaddr[..6]);
        Some(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Store-key prefixes from shortest (one byte) to longest (five bytes).
    ///
    /// The full six-byte address is not included: that key is the MAC's own
    /// binding entry, which is applied as its own configuration layer.
    pub fn prefixes(&self) -> impl Iterator<Item = String> + '_ {
        (1..=5).map(move |len| {
            self.0[..len]
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":")
        })
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseMacError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] =
                u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Invalid MAC address text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddr = "AA:BB:cc:dd:EE:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");

        let dashed: MacAddr = "aa-bb-cc-dd-ee-ff".parse().unwrap();
        assert_eq!(dashed, mac);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_from_chaddr() {
        let chaddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mac = MacAddr::from_chaddr(&chaddr).unwrap();
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");

        assert!(MacAddr::from_chaddr(&[0x00, 0x11]).is_none());
    }

    #[test]
    fn test_prefixes_shortest_first() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let prefixes: Vec<String> = mac.prefixes().collect();
        assert_eq!(
            prefixes,
            vec!["aa", "aa:bb", "aa:bb:cc", "aa:bb:cc:dd", "aa:bb:cc:dd:ee"]
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"aa:bb:cc:dd:ee:ff\"");
        let restored: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, mac);
    }
}
