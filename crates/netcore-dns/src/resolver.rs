//! Store-backed question resolution.
//!
//! Per question: fetch the CNAME and requested-type record sets in parallel
//! and consume CNAME-first, build one RR per live value, chase aliases with
//! a bounded iterative loop, and fall back to the forwarders when nothing
//! was found and no ancestor zone is ours. The answer TTL is the minimum of
//! the configured default, the entry and value TTLs, and any value's
//! remaining time to expiration, taken across the whole chase chain.

use async_trait::async_trait;
use chrono::Utc;
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SOA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use netcore_common::names;
use netcore_store::Store;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{LookupContext, Resolve};
use crate::entry::{Question, RecordEntry, RecordValue};
use crate::forwarder;

/// SOA timing fields are fixed; only caching resolvers consume them.
const SOA_TIMING: i32 = 60;

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// TTL applied when neither the entry nor its values carry one.
    pub default_ttl: u32,
    /// Upstream resolvers, tried in order. Empty disables recursion, as
    /// does a leading `"!"` entry.
    pub forwarders: Vec<String>,
    /// Alias-chase bound.
    pub max_chase_depth: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_ttl: 10800,
            forwarders: Vec::new(),
            max_chase_depth: 8,
        }
    }
}

/// Store-backed resolver for one instance.
pub struct Resolver {
    store: Arc<dyn Store>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    /// Resolve one question into its answer records.
    pub async fn answer_question(&self, question: &Question) -> Vec<Record> {
        let mut chain: Vec<Record> = Vec::new();
        let mut forwarded: Vec<Record> = Vec::new();
        let mut chain_ttl = self.config.default_ttl;

        let mut current = names::ensure_trailing_dot(&question.name).to_lowercase();
        let mut visited: HashSet<String> = HashSet::from([current.clone()]);
        let mut depth = 0;

        loop {
            let Some((entry, rr_type)) = self.fetch_best(&current, question.qtype).await else {
                if !self.have_authority(&current).await {
                    debug!(name = %current, qtype = %question.qtype, "forwarding");
                    forwarded = forwarder::forward(
                        &current,
                        question.qtype,
                        &self.config.forwarders,
                    )
                    .await;
                }
                break;
            };

            debug!(name = %current, rr_type = %rr_type, "found");
            let level = build_level(&current, rr_type, &entry, self.config.default_ttl);
            chain_ttl = chain_ttl.min(level.ttl);
            chain.extend(level.records);

            let Some(target) = level.chase else { break };
            if depth >= self.config.max_chase_depth || !visited.insert(target.clone()) {
                warn!(name = %current, target = %target, "alias chase stopped");
                break;
            }
            current = target;
            depth += 1;
        }

        for record in &mut chain {
            record.set_ttl(chain_ttl);
        }
        chain.extend(forwarded);
        chain
    }

    /// Fetch the CNAME and requested-type entries in parallel; a CNAME at
    /// the name always wins.
    async fn fetch_best(
        &self,
        name: &str,
        qtype: RecordType,
    ) -> Option<(RecordEntry, RecordType)> {
        if qtype == RecordType::CNAME {
            return self
                .fetch_entry(name, RecordType::CNAME)
                .await
                .map(|e| (e, RecordType::CNAME));
        }
        let (cname, primary) = tokio::join!(
            self.fetch_entry(name, RecordType::CNAME),
            self.fetch_entry(name, qtype)
        );
        if let Some(entry) = cname {
            return Some((entry, RecordType::CNAME));
        }
        primary.map(|e| (e, qtype))
    }

    /// Fetch one record set. Store failures read as a miss so the question
    /// can still be answered by a forwarder.
    async fn fetch_entry(&self, name: &str, rtype: RecordType) -> Option<RecordEntry> {
        let key = names::rr_key(name, &rtype.to_string());
        match self.store.get(&key, true, true).await {
            Ok(node) => node.as_ref().and_then(RecordEntry::from_node),
            Err(e) => {
                warn!(key = %key, error = %e, "record fetch failed, treating as miss");
                None
            }
        }
    }

    /// An SOA (or DNAME) at the name or any proper ancestor short of the
    /// TLD means the zone is ours and the question must not be forwarded.
    async fn have_authority(&self, name: &str) -> bool {
        let trimmed = name.trim_end_matches('.');
        let labels: Vec<&str> = trimmed.split('.').filter(|l| !l.is_empty()).collect();
        for i in 0..labels.len().saturating_sub(1) {
            let ancestor = labels[i..].join(".");
            if self.has_record(&ancestor, "soa").await || self.has_record(&ancestor, "dname").await
            {
                return true;
            }
        }
        false
    }

    async fn has_record(&self, name: &str, rtype: &str) -> bool {
        match self.store.get(&names::rr_key(name, rtype), false, false).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(name = %name, rtype = %rtype, error = %e, "authority probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl Resolve for Resolver {
    async fn resolve(&self, ctx: LookupContext, question: Question) -> Vec<Record> {
        debug!(event = %ctx.event, question = %question, "resolving");
        self.answer_question(&question).await
    }
}

/// One chase level's worth of records and its TTL contribution.
struct Level {
    records: Vec<Record>,
    ttl: u32,
    chase: Option<String>,
}

fn build_level(name: &str, rr_type: RecordType, entry: &RecordEntry, default_ttl: u32) -> Level {
    let mut level = Level {
        records: Vec::new(),
        ttl: entry.ttl.unwrap_or(default_ttl),
        chase: None,
    };
    let Ok(owner) = Name::from_str(name) else {
        return level;
    };

    if rr_type == RecordType::SOA {
        if let Some(record) = soa_record(owner, entry) {
            level.records.push(record);
        }
        return level;
    }

    let now = Utc::now().timestamp();
    for value in &entry.values {
        if let Some(expiration) = value.expiration {
            let remaining = expiration.timestamp() - now;
            if remaining < 0 {
                continue;
            }
            level.ttl = level.ttl.min(remaining.min(u32::MAX as i64) as u32);
        }
        if let Some(ttl) = value.ttl {
            level.ttl = level.ttl.min(ttl);
        }

        let rdata = match rr_type {
            RecordType::A => value.value.parse().ok().map(|ip| RData::A(A(ip))),
            RecordType::AAAA => value.value.parse().ok().map(|ip| RData::AAAA(AAAA(ip))),
            RecordType::TXT => Some(RData::TXT(TXT::new(vec![value.value.clone()]))),
            RecordType::NS => target_name(&value.value).map(|n| RData::NS(NS(n))),
            RecordType::PTR => target_name(&value.value).map(|n| RData::PTR(PTR(n))),
            RecordType::CNAME => {
                let target = names::ensure_trailing_dot(&value.value).to_lowercase();
                if level.chase.is_none() {
                    level.chase = Some(target.clone());
                }
                target_name(&target).map(|n| RData::CNAME(CNAME(n)))
            }
            RecordType::MX => mx_rdata(value),
            RecordType::SRV => srv_rdata(value),
            _ => None,
        };
        if let Some(rdata) = rdata {
            level.records.push(Record::from_rdata(owner.clone(), 0, rdata));
        }
    }
    level
}

fn soa_record(owner: Name, entry: &RecordEntry) -> Option<Record> {
    let ns = entry.meta.get("ns").map(String::as_str).unwrap_or_default();
    let mbox = entry.meta.get("mbox").map(String::as_str).unwrap_or_default();
    let mname = target_name(ns)?;
    let rname = target_name(mbox)?;
    let serial = Utc::now().timestamp() as u32;
    let soa = SOA::new(
        mname,
        rname,
        serial,
        SOA_TIMING,
        SOA_TIMING,
        SOA_TIMING,
        SOA_TIMING as u32,
    );
    Some(Record::from_rdata(owner, 0, RData::SOA(soa)))
}

fn mx_rdata(value: &RecordValue) -> Option<RData> {
    let preference = value
        .attr("priority")
        .and_then(|p| p.parse().ok())
        .unwrap_or(50);
    let target = value.attr("target").unwrap_or(&value.value);
    let exchange = target_name(target)?;
    Some(RData::MX(MX::new(preference, exchange)))
}

fn srv_rdata(value: &RecordValue) -> Option<RData> {
    let priority = value.attr("priority").and_then(|p| p.parse().ok()).unwrap_or(50);
    let weight = value.attr("weight").and_then(|w| w.parse().ok()).unwrap_or(50);
    let mut port = value.attr("port").and_then(|p| p.parse().ok()).unwrap_or(0);

    let target = match value.attr("target") {
        Some(target) => target_name(target)?,
        None => {
            // Simplified form: the value itself is `host` or `host:port`.
            let mut parts = value.value.splitn(2, ':');
            let host = parts.next()?;
            if let Some(p) = parts.next().and_then(|p| p.parse().ok()) {
                port = p;
            }
            target_name(host)?
        }
    };
    Some(RData::SRV(SRV::new(priority, weight, port, target)))
}

fn target_name(value: &str) -> Option<Name> {
    Name::from_str(&names::ensure_trailing_dot(value)).ok()
}
