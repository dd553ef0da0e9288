//! etcd v2 REST backend.
//!
//! Speaks the `/v2/keys` HTTP API directly: TTLs ride on the `ttl` form
//! field, atomic create is `prevExist=false`, and compare-and-swap is
//! `prevValue=…`. Multiple endpoints are tried in order on transport
//! failure; application-level errors are mapped from etcd error codes.

use crate::{normalize_key, Node, Result, Store, StoreError, WatchAction, WatchEvent, WatchStream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ERR_KEY_NOT_FOUND: i64 = 100;
const ERR_TEST_FAILED: i64 = 101;
const ERR_NOT_A_FILE: i64 = 102;
const ERR_NODE_EXIST: i64 = 105;

/// etcd v2 implementation of [`Store`].
pub struct EtcdStore {
    endpoints: Vec<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EtcdReply {
    node: Option<EtcdNode>,
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default)]
    ttl: Option<i64>,
    #[serde(default)]
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: i64,
    message: String,
    #[serde(default)]
    cause: String,
}

impl EtcdStore {
    /// Build a store over the given endpoints (e.g. `http://etcd:2379`).
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Transport("no etcd endpoints provided".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            http,
        })
    }

    fn urls(&self, key: &str, query: &str) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|ep| {
                if query.is_empty() {
                    format!("{ep}/v2/keys/{key}")
                } else {
                    format!("{ep}/v2/keys/{key}?{query}")
                }
            })
            .collect()
    }

    /// Issue the request against each endpoint until one answers.
    async fn exchange(
        &self,
        key: &str,
        query: &str,
        method: reqwest::Method,
        form: Option<Vec<(&'static str, String)>>,
    ) -> Result<(reqwest::StatusCode, String)> {
        let mut last_err = None;
        for url in self.urls(key, query) {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(ref fields) = form {
                request = request.form(fields);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .map_err(|e| StoreError::Transport(e.to_string()))?;
                    return Ok((status, body));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "etcd endpoint unreachable");
                    last_err = Some(StoreError::Transport(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Transport("no endpoints".to_string())))
    }

    fn parse_reply(key: &str, status: reqwest::StatusCode, body: &str) -> Result<EtcdReply> {
        if status.is_success() {
            return serde_json::from_str(body)
                .map_err(|e| StoreError::InvalidResponse(format!("{key}: {e}")));
        }
        let err: EtcdErrorBody = serde_json::from_str(body)
            .map_err(|e| StoreError::InvalidResponse(format!("{key}: {status}: {e}")))?;
        debug!(key = %key, code = err.error_code, cause = %err.cause, "etcd error reply");
        Err(match err.error_code {
            ERR_KEY_NOT_FOUND => StoreError::NotFound(key.to_string()),
            ERR_TEST_FAILED => StoreError::CasFailed(key.to_string()),
            ERR_NOT_A_FILE => StoreError::NotAFile(key.to_string()),
            ERR_NODE_EXIST => StoreError::AlreadyExists(key.to_string()),
            _ => StoreError::Transport(format!("{key}: {}", err.message)),
        })
    }

    fn write_form(value: &str, ttl: Option<Duration>) -> Vec<(&'static str, String)> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl).to_string()));
        }
        form
    }
}

/// Whole-second TTL for the wire, rounding sub-second remainders up.
fn ttl_secs(ttl: Duration) -> u64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    secs
}

fn convert_node(node: EtcdNode) -> Node {
    Node {
        key: normalize_key(&node.key),
        value: node.value.unwrap_or_default(),
        dir: node.dir,
        nodes: node.nodes.into_iter().map(convert_node).collect(),
        ttl: node.ttl,
        expiration: node
            .expiration
            .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str, recursive: bool, sorted: bool) -> Result<Option<Node>> {
        let key = normalize_key(key);
        let query = format!("recursive={recursive}&sorted={sorted}");
        let (status, body) = self
            .exchange(&key, &query, reqwest::Method::GET, None)
            .await?;
        match Self::parse_reply(&key, status, &body) {
            Ok(reply) => Ok(reply.node.map(convert_node)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize_key(key);
        let (status, body) = self
            .exchange(&key, "", reqwest::Method::PUT, Some(Self::write_form(value, ttl)))
            .await?;
        Self::parse_reply(&key, status, &body).map(|_| ())
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize_key(key);
        let (status, body) = self
            .exchange(
                &key,
                "prevExist=false",
                reqwest::Method::PUT,
                Some(Self::write_form(value, ttl)),
            )
            .await?;
        Self::parse_reply(&key, status, &body).map(|_| ())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_value: &str,
    ) -> Result<()> {
        let key = normalize_key(key);
        let query = format!(
            "prevValue={}",
            urlencode(prev_value)
        );
        let (status, body) = self
            .exchange(&key, &query, reqwest::Method::PUT, Some(Self::write_form(value, ttl)))
            .await?;
        match Self::parse_reply(&key, status, &body) {
            Ok(_) => Ok(()),
            // etcd reports CAS on a missing key as not-found; both are a failed swap
            Err(StoreError::NotFound(k)) => Err(StoreError::CasFailed(k)),
            Err(e) => Err(e),
        }
    }

    async fn mkdir(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize_key(key);
        let mut form = vec![
            ("dir", "true".to_string()),
            ("prevExist", "false".to_string()),
        ];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl).to_string()));
        }
        let (status, body) = self
            .exchange(&key, "", reqwest::Method::PUT, Some(form))
            .await?;
        Self::parse_reply(&key, status, &body).map(|_| ())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = normalize_key(key);
        let query = format!("recursive={recursive}");
        let (status, body) = self
            .exchange(&key, &query, reqwest::Method::DELETE, None)
            .await?;
        Self::parse_reply(&key, status, &body).map(|_| ())
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<WatchStream> {
        let key = normalize_key(key);
        let (tx, rx) = mpsc::channel(64);
        let http = self.http.clone();
        let urls = self.urls(&key, &format!("wait=true&recursive={recursive}"));
        tokio::spawn(async move {
            loop {
                let mut delivered = false;
                for url in &urls {
                    let Ok(response) = http.get(url).send().await else {
                        continue;
                    };
                    let Ok(body) = response.text().await else {
                        continue;
                    };
                    let Ok(reply) = serde_json::from_str::<EtcdReply>(&body) else {
                        continue;
                    };
                    let Some(node) = reply.node else { continue };
                    let action = match reply.action.as_deref() {
                        Some("delete") => WatchAction::Delete,
                        Some("expire") => WatchAction::Expire,
                        _ => WatchAction::Set,
                    };
                    let event = WatchEvent {
                        action,
                        key: normalize_key(&node.key),
                        value: node.value,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    delivered = true;
                    break;
                }
                if !delivered {
                    // All endpoints failed; back off before re-polling.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        Ok(rx)
    }
}

/// Percent-encode a query value. Only the characters that appear in netcore
/// values (MAC colons, IP dots, spaces) need escaping.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
