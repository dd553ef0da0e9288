//! Instance identity.
//!
//! Multiple netcore instances may share one store; each needs a stable name
//! to find its own `config/instance/<id>/` subtree. The core never reads
//! process environment itself — the CLI driver snapshots the environment and
//! resolves an identity up front.

use serde::{Deserialize, Serialize};

/// The resolved identity of this running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Resolve an instance name from an environment snapshot.
    ///
    /// Precedence: `NETCORE_NAME`, then the leading path component of
    /// `ETCD_NAME` (matching `/<component>/...`), then the host FQDN. Empty
    /// values never win. Returns `None` when nothing usable was supplied.
    pub fn resolve(
        netcore_name: Option<&str>,
        etcd_name: Option<&str>,
        fqdn: Option<&str>,
    ) -> Option<Self> {
        if let Some(name) = non_empty(netcore_name) {
            return Some(Self::new(name));
        }
        if let Some(etcd) = non_empty(etcd_name) {
            if let Some(component) = leading_path_component(etcd) {
                return Some(Self::new(component));
            }
        }
        non_empty(fqdn).map(Self::new)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Extract `name` from a string shaped like `/name/rest`.
fn leading_path_component(value: &str) -> Option<&str> {
    let rest = value.strip_prefix('/')?;
    let (component, _) = rest.split_once('/')?;
    if component.is_empty() {
        None
    } else {
        Some(component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netcore_name_wins() {
        let id = Identity::resolve(Some("alpha"), Some("/beta/0"), Some("host.example.com"));
        assert_eq!(id.unwrap().name, "alpha");
    }

    #[test]
    fn test_empty_netcore_name_skipped() {
        let id = Identity::resolve(Some(""), Some("/beta/0"), None);
        assert_eq!(id.unwrap().name, "beta");
    }

    #[test]
    fn test_etcd_name_requires_path_shape() {
        // No leading slash / trailing component: fall through to the FQDN.
        let id = Identity::resolve(None, Some("beta"), Some("host.example.com"));
        assert_eq!(id.unwrap().name, "host.example.com");

        let id = Identity::resolve(None, Some("//"), Some("host.example.com"));
        assert_eq!(id.unwrap().name, "host.example.com");
    }

    #[test]
    fn test_nothing_usable() {
        assert!(Identity::resolve(None, None, None).is_none());
        assert!(Identity::resolve(Some(" "), Some(""), Some("")).is_none());
    }
}
