//! Storage backends for netcore.
//!
//! Both services treat one hierarchical key/value store as the canonical
//! source of truth: reservations, leases, resource records, and per-host
//! configuration all live here, and lease uniqueness is enforced with the
//! store's atomic create and compare-and-swap primitives rather than any
//! in-process lock.
//!
//! Two implementations are provided:
//! - [`MemoryStore`] — in-process tree with native TTL expiry, used by tests
//!   and single-node development runs.
//! - [`EtcdStore`] — etcd v2 REST driver, the production backend shared by
//!   every instance on the network.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("compare-and-swap failed: {0}")]
    CasFailed(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A node in the store hierarchy.
///
/// Scalar nodes carry a `value`; directory nodes carry `nodes`. A key with a
/// TTL reports the remaining whole seconds and the absolute expiration time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub dir: bool,
    pub nodes: Vec<Node>,
    pub ttl: Option<i64>,
    pub expiration: Option<DateTime<Utc>>,
}

impl Node {
    /// Find a direct child by its final key segment.
    pub fn child(&self, segment: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.key_segment() == segment)
    }

    /// The last path segment of this node's key.
    pub fn key_segment(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Set,
    Delete,
    Expire,
}

/// Stream of watch events; dropped receivers end the watch.
pub type WatchStream = tokio::sync::mpsc::Receiver<WatchEvent>;

/// The store operations netcore depends on.
///
/// The trait is object-safe and shared as `Arc<dyn Store>`. Missing keys are
/// `Ok(None)` from [`Store::get`] — absence is an answer, not an error — while
/// every other variant of [`StoreError`] signals a real fault.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a node. `recursive` includes the full subtree of a directory,
    /// `sorted` orders children by key.
    async fn get(&self, key: &str, recursive: bool, sorted: bool) -> Result<Option<Node>>;

    /// Create or overwrite a scalar key.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Create a scalar key, failing with [`StoreError::AlreadyExists`] if the
    /// key is present. This is the primitive behind lease uniqueness.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically replace `key` only if its current value equals
    /// `prev_value`, refreshing the TTL. Fails with
    /// [`StoreError::CasFailed`] on mismatch or absence.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_value: &str,
    ) -> Result<()>;

    /// Create a directory, optionally with a TTL that expires the whole
    /// subtree. Existing directories yield [`StoreError::AlreadyExists`],
    /// which callers routinely ignore.
    async fn mkdir(&self, key: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key; directories require `recursive`.
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;

    /// Observe changes under a key. Reserved for configuration hot-reload.
    async fn watch(&self, key: &str, recursive: bool) -> Result<WatchStream>;
}

/// Storage configuration selected by the CLI driver.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// In-memory storage (tests and local development).
    Memory,
    /// etcd v2 endpoints, e.g. `http://etcd:2379`.
    Etcd { endpoints: Vec<String> },
}

/// Create a store from configuration.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Etcd { endpoints } => Ok(Arc::new(EtcdStore::new(endpoints.clone())?)),
    }
}

/// Normalize a store key: no leading or trailing slashes, no empty segments.
pub(crate) fn normalize_key(key: &str) -> String {
    key.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
