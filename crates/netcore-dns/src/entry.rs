//! Store records for DNS.
//!
//! A record set lives at `dns/<reversed-name>/@<rrtype>`: a `ttl` child, a
//! `val/` directory with one content-hashed child per value, and any other
//! scalar children as metadata (SOA `ns` and `mbox` live there). A value may
//! itself carry attribute children (`priority`, `weight`, `port`, `target`)
//! for the record types that need them.

use chrono::{DateTime, Utc};
use hickory_proto::rr::{DNSClass, RecordType};
use netcore_store::Node;
use std::collections::BTreeMap;

/// A cache- and resolver-facing DNS question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    /// Fully qualified, lowercase, trailing dot.
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DNSClass,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Self {
            name: name.into().to_lowercase(),
            qtype,
            qclass: DNSClass::IN,
        }
    }
}

impl std::fmt::Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.qtype)
    }
}

/// One record set read from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordEntry {
    pub ttl: Option<u32>,
    pub meta: BTreeMap<String, String>,
    pub values: Vec<RecordValue>,
}

/// One value within a record set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordValue {
    pub value: String,
    pub ttl: Option<u32>,
    pub expiration: Option<DateTime<Utc>>,
    pub attrs: BTreeMap<String, String>,
}

impl RecordEntry {
    /// Decode a recursively fetched `@<rrtype>` node.
    ///
    /// Returns `None` for empty directories: a record set with no children
    /// carries no answers and reads as absent.
    pub fn from_node(node: &Node) -> Option<Self> {
        if node.nodes.is_empty() {
            return None;
        }
        let mut entry = RecordEntry::default();
        for child in &node.nodes {
            let segment = child.key_segment();
            if child.dir {
                if segment == "val" {
                    entry.values = child.nodes.iter().map(RecordValue::from_node).collect();
                }
            } else {
                match segment {
                    "ttl" => {
                        if let Ok(ttl) = child.value.parse::<u32>() {
                            if ttl > 0 {
                                entry.ttl = Some(ttl);
                            }
                        }
                    }
                    // Meta keys are case-sensitive.
                    _ => {
                        entry.meta.insert(segment.to_string(), child.value.clone());
                    }
                }
            }
        }
        Some(entry)
    }
}

impl RecordValue {
    fn from_node(node: &Node) -> Self {
        let mut value = RecordValue {
            value: node.value.clone(),
            ttl: node.ttl.filter(|t| *t > 0).map(|t| t as u32),
            expiration: node.expiration,
            attrs: BTreeMap::new(),
        };
        for attr in &node.nodes {
            if !attr.dir {
                value
                    .attrs
                    .insert(attr.key_segment().to_string(), attr.value.clone());
            }
        }
        value
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_store::{MemoryStore, Store};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_entry_decoding() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("dns/example/www/@a/ttl", "300", None).await.unwrap();
        store.set("dns/example/www/@a/note", "managed", None).await.unwrap();
        store.set("dns/example/www/@a/val/h1", "10.0.0.2", None).await.unwrap();
        store.set("dns/example/www/@a/val/h2", "10.0.0.3", None).await.unwrap();

        let node = store.get("dns/example/www/@a", true, true).await.unwrap().unwrap();
        let entry = RecordEntry::from_node(&node).unwrap();

        assert_eq!(entry.ttl, Some(300));
        assert_eq!(entry.meta.get("note").map(String::as_str), Some("managed"));
        assert_eq!(entry.values.len(), 2);
        assert_eq!(entry.values[0].value, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_value_attrs_decoded() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set("dns/example/@mx/val/h1/priority", "10", None).await.unwrap();
        store.set("dns/example/@mx/val/h1/target", "mail.example.com", None).await.unwrap();

        let node = store.get("dns/example/@mx", true, true).await.unwrap().unwrap();
        let entry = RecordEntry::from_node(&node).unwrap();

        assert_eq!(entry.values.len(), 1);
        assert_eq!(entry.values[0].attr("priority"), Some("10"));
        assert_eq!(entry.values[0].attr("target"), Some("mail.example.com"));
    }

    #[tokio::test]
    async fn test_empty_entry_is_absent() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.mkdir("dns/example/www/@a", None).await.unwrap();

        let node = store.get("dns/example/www/@a", true, true).await.unwrap().unwrap();
        assert!(RecordEntry::from_node(&node).is_none());
    }

    #[tokio::test]
    async fn test_value_ttl_from_key_ttl() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .set(
                "dns/example/www/@a/val/h1",
                "10.0.0.2",
                Some(std::time::Duration::from_secs(120)),
            )
            .await
            .unwrap();

        let node = store.get("dns/example/www/@a", true, true).await.unwrap().unwrap();
        let entry = RecordEntry::from_node(&node).unwrap();
        assert_eq!(entry.values[0].ttl, Some(120));
        assert!(entry.values[0].expiration.is_some());
    }

    #[test]
    fn test_question_normalizes_case() {
        let q = Question::new("WWW.Example.", RecordType::A);
        assert_eq!(q.name, "www.example.");
        assert_eq!(q.qclass, DNSClass::IN);
    }
}
