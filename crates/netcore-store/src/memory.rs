//! In-memory store backend.
//!
//! A guarded tree with native per-key TTL expiry. Expired nodes are pruned
//! lazily at the start of every operation; expiry uses the tokio clock so
//! tests can pause and advance time deterministically.

use crate::{normalize_key, Node, Result, Store, StoreError, WatchAction, WatchEvent, WatchStream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct MemNode {
    /// `None` marks a directory.
    value: Option<String>,
    children: BTreeMap<String, MemNode>,
    expires_at: Option<Instant>,
    expires_wall: Option<DateTime<Utc>>,
}

impl MemNode {
    fn dir() -> Self {
        Self::default()
    }

    fn scalar(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: Some(value.to_string()),
            children: BTreeMap::new(),
            expires_at: ttl.map(|d| Instant::now() + d),
            expires_wall: ttl.and_then(|d| {
                Utc::now().checked_add_signed(chrono::Duration::from_std(d).ok()?)
            }),
        }
    }

    fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

/// In-memory implementation of [`Store`].
pub struct MemoryStore {
    root: Mutex<MemNode>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            root: Mutex::new(MemNode::dir()),
            events,
        }
    }

    fn emit(&self, action: WatchAction, key: &str, value: Option<&str>) {
        let _ = self.events.send(WatchEvent {
            action,
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }

    /// Drop every expired node in the tree, reporting the removed keys.
    fn prune(&self, root: &mut MemNode) {
        let now = Instant::now();
        let mut expired = Vec::new();
        prune_node(root, "", now, &mut expired);
        for key in expired {
            self.emit(WatchAction::Expire, &key, None);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_node(node: &mut MemNode, path: &str, now: Instant, expired: &mut Vec<String>) {
    node.children.retain(|segment, child| {
        let child_path = if path.is_empty() {
            segment.clone()
        } else {
            format!("{path}/{segment}")
        };
        if child.expires_at.is_some_and(|at| at <= now) {
            expired.push(child_path);
            false
        } else {
            prune_node(child, &child_path, now, expired);
            true
        }
    });
}

fn find<'a>(root: &'a MemNode, segments: &[&str]) -> Option<&'a MemNode> {
    let mut node = root;
    for segment in segments {
        node = node.children.get(*segment)?;
    }
    Some(node)
}

/// Walk to the parent of `segments`, creating intermediate directories.
fn ensure_parent<'a>(
    root: &'a mut MemNode,
    segments: &[&str],
    key: &str,
) -> Result<&'a mut MemNode> {
    let mut node = root;
    for segment in &segments[..segments.len() - 1] {
        let entry = node
            .children
            .entry(segment.to_string())
            .or_insert_with(MemNode::dir);
        if !entry.is_dir() {
            return Err(StoreError::NotAFile(key.to_string()));
        }
        node = entry;
    }
    Ok(node)
}

fn remaining_secs(expires_at: Instant) -> i64 {
    let remaining = expires_at.saturating_duration_since(Instant::now());
    let mut secs = remaining.as_secs() as i64;
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }
    secs
}

fn snapshot(node: &MemNode, key: &str, depth: usize) -> Node {
    Node {
        key: key.to_string(),
        value: node.value.clone().unwrap_or_default(),
        dir: node.is_dir(),
        nodes: if depth > 0 {
            node.children
                .iter()
                .map(|(segment, child)| snapshot(child, &format!("{key}/{segment}"), depth - 1))
                .collect()
        } else {
            Vec::new()
        },
        ttl: node.expires_at.map(remaining_secs),
        expiration: node.expires_wall,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str, recursive: bool, _sorted: bool) -> Result<Option<Node>> {
        let key = normalize_key(key);
        let mut root = self.root.lock().unwrap();
        self.prune(&mut root);

        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let depth = if recursive { usize::MAX } else { 1 };
        Ok(find(&root, &segments).map(|node| snapshot(node, &key, depth)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize_key(key);
        let mut root = self.root.lock().unwrap();
        self.prune(&mut root);

        let segments: Vec<&str> = key.split('/').collect();
        let parent = ensure_parent(&mut root, &segments, &key)?;
        let segment = segments[segments.len() - 1];
        if let Some(existing) = parent.children.get(segment) {
            if existing.is_dir() {
                return Err(StoreError::NotAFile(key.clone()));
            }
        }
        parent
            .children
            .insert(segment.to_string(), MemNode::scalar(value, ttl));
        drop(root);
        self.emit(WatchAction::Set, &key, Some(value));
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize_key(key);
        let mut root = self.root.lock().unwrap();
        self.prune(&mut root);

        let segments: Vec<&str> = key.split('/').collect();
        let parent = ensure_parent(&mut root, &segments, &key)?;
        let segment = segments[segments.len() - 1];
        if parent.children.contains_key(segment) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        parent
            .children
            .insert(segment.to_string(), MemNode::scalar(value, ttl));
        drop(root);
        self.emit(WatchAction::Set, &key, Some(value));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_value: &str,
    ) -> Result<()> {
        let key = normalize_key(key);
        let mut root = self.root.lock().unwrap();
        self.prune(&mut root);

        let segments: Vec<&str> = key.split('/').collect();
        let parent = ensure_parent(&mut root, &segments, &key)?;
        let segment = segments[segments.len() - 1];
        match parent.children.get_mut(segment) {
            Some(node) if node.value.as_deref() == Some(prev_value) => {
                *node = MemNode::scalar(value, ttl);
            }
            Some(_) | None => return Err(StoreError::CasFailed(key.clone())),
        }
        drop(root);
        self.emit(WatchAction::Set, &key, Some(value));
        Ok(())
    }

    async fn mkdir(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize_key(key);
        let mut root = self.root.lock().unwrap();
        self.prune(&mut root);

        let segments: Vec<&str> = key.split('/').collect();
        let parent = ensure_parent(&mut root, &segments, &key)?;
        let segment = segments[segments.len() - 1];
        if parent.children.contains_key(segment) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        let mut dir = MemNode::dir();
        dir.expires_at = ttl.map(|d| Instant::now() + d);
        dir.expires_wall = ttl.and_then(|d| {
            Utc::now().checked_add_signed(chrono::Duration::from_std(d).ok()?)
        });
        parent.children.insert(segment.to_string(), dir);
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = normalize_key(key);
        let mut root = self.root.lock().unwrap();
        self.prune(&mut root);

        let segments: Vec<&str> = key.split('/').collect();
        let parent = match segments.len() {
            0 => return Err(StoreError::NotFound(key.clone())),
            1 => &mut *root,
            _ => {
                let mut node = &mut *root;
                for segment in &segments[..segments.len() - 1] {
                    node = node
                        .children
                        .get_mut(*segment)
                        .ok_or_else(|| StoreError::NotFound(key.clone()))?;
                }
                node
            }
        };
        let segment = segments[segments.len() - 1];
        let target = parent
            .children
            .get(segment)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if target.is_dir() && !target.children.is_empty() && !recursive {
            return Err(StoreError::NotAFile(key.clone()));
        }
        parent.children.remove(segment);
        drop(root);
        self.emit(WatchAction::Delete, &key, None);
        Ok(())
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<WatchStream> {
        let key = normalize_key(key);
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let matches = event.key == key
                    || (recursive && event.key.starts_with(&format!("{key}/")));
                if matches && tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("network/lab/lease/10.0.0.2", "aa:bb:cc:dd:ee:ff", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let node = store
            .get("network/lab/lease/10.0.0.2", false, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.ttl, Some(60));

        tokio::time::advance(Duration::from_secs(61)).await;

        let gone = store.get("network/lab/lease/10.0.0.2", false, false).await.unwrap();
        assert!(gone.is_none());

        // Expired leases no longer block creation
        store
            .create("network/lab/lease/10.0.0.2", "11:22:33:44:55:66", None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_counts_down() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(100))).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        let node = store.get("k", false, false).await.unwrap().unwrap();
        assert_eq!(node.ttl, Some(60));
        assert!(node.expiration.is_some());
    }

    #[tokio::test]
    async fn test_intermediate_dirs_created() {
        let store = MemoryStore::new();
        store.set("a/b/c/d", "v", None).await.unwrap();

        let b = store.get("a/b", false, false).await.unwrap().unwrap();
        assert!(b.dir);
        assert_eq!(b.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_set_over_directory_rejected() {
        let store = MemoryStore::new();
        store.set("a/b", "v", None).await.unwrap();
        let err = store.set("a", "v", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotAFile(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.set("a/b", "v", None).await.unwrap();

        let err = store.delete("a", false).await.unwrap_err();
        assert!(matches!(err, StoreError::NotAFile(_)));

        store.delete("a", true).await.unwrap();
        assert!(store.get("a", false, false).await.unwrap().is_none());

        let err = store.delete("missing", false).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mkdir() {
        let store = MemoryStore::new();
        store.mkdir("dns", None).await.unwrap();
        let node = store.get("dns", false, false).await.unwrap().unwrap();
        assert!(node.dir);

        let err = store.mkdir("dns", None).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mkdir_ttl_expires_subtree() {
        let store = MemoryStore::new();
        store.mkdir("tmp", Some(Duration::from_secs(30))).await.unwrap();
        store.set("tmp/child", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(store.get("tmp", true, false).await.unwrap().is_none());
        assert!(store.get("tmp/child", false, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_recursive_get_lists_stubs() {
        let store = MemoryStore::new();
        store.set("dir/sub/leaf", "v", None).await.unwrap();

        let node = store.get("dir", false, false).await.unwrap().unwrap();
        assert_eq!(node.nodes.len(), 1);
        assert!(node.nodes[0].nodes.is_empty());

        let node = store.get("dir", true, false).await.unwrap().unwrap();
        assert_eq!(node.nodes[0].nodes.len(), 1);
        assert_eq!(node.nodes[0].nodes[0].value, "v");
    }

    #[tokio::test]
    async fn test_watch_sees_set_and_delete() {
        let store = MemoryStore::new();
        let mut watch = store.watch("config", true).await.unwrap();

        store.set("config/global/network", "lab", None).await.unwrap();
        store.set("unrelated", "x", None).await.unwrap();
        store.delete("config/global/network", false).await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.action, WatchAction::Set);
        assert_eq!(first.key, "config/global/network");
        assert_eq!(first.value.as_deref(), Some("lab"));

        let second = watch.recv().await.unwrap();
        assert_eq!(second.action, WatchAction::Delete);
    }
}
