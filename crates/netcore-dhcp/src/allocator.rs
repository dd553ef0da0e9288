//! Lease and address allocation.
//!
//! Candidate addresses come from the binding's assignment set (reservations
//! first) and fall back to a linear scan of the pool. Lease uniqueness is
//! the store's job: `create` fails for the loser of a race and `renew` is a
//! compare-and-swap keyed on the holding MAC. The per-IP lease key is
//! authoritative; the mirror under the MAC directory is advisory and may lag.

use ipnet::Ipv4Net;
use netcore_common::{binding::sort_assignments, AssignmentMode, Binding, MacAddr};
use netcore_store::{Store, StoreError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Padding added to every lease TTL to hide network delay at the boundary.
pub const LEASE_TTL_PAD: Duration = Duration::from_millis(500);

/// An active lease read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub ip: Ipv4Addr,
    pub holder: MacAddr,
    pub remaining: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Free,
    HeldBySelf,
    HeldByOther,
}

/// Store-backed lease allocator for one network.
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn Store>,
    network: String,
}

impl Allocator {
    pub fn new(store: Arc<dyn Store>, network: impl Into<String>) -> Self {
        Self {
            store,
            network: network.into(),
        }
    }

    fn lease_key(&self, ip: Ipv4Addr) -> String {
        format!("network/{}/lease/{}", self.network, ip)
    }

    fn mirror_key(&self, mac: MacAddr) -> String {
        format!("network/{}/mac/{}", self.network, mac)
    }

    /// Read the authoritative lease record for an address.
    pub async fn lookup_by_ip(&self, ip: Ipv4Addr) -> Result<Option<LeaseInfo>> {
        let node = self.store.get(&self.lease_key(ip), false, false).await?;
        Ok(node.and_then(|n| {
            let holder: MacAddr = n.value.parse().ok()?;
            Some(LeaseInfo {
                ip,
                holder,
                remaining: n.ttl.map(|t| Duration::from_secs(t.max(0) as u64)),
            })
        }))
    }

    /// Find the lease currently held by a MAC.
    ///
    /// The mirror pointer gives the candidate address; the per-IP key
    /// confirms it. A mirror pointing at an address someone else holds is
    /// stale and reads as no lease.
    pub async fn lookup_by_mac(&self, mac: MacAddr) -> Result<Option<LeaseInfo>> {
        let mirror = self
            .store
            .get(&format!("{}/ip", self.mirror_key(mac)), false, false)
            .await?;
        let Some(ip) = mirror.and_then(|n| n.value.parse::<Ipv4Addr>().ok()) else {
            return Ok(None);
        };
        Ok(self
            .lookup_by_ip(ip)
            .await?
            .filter(|lease| lease.holder == mac))
    }

    /// Atomically claim an address. `Ok(false)` means another MAC won.
    pub async fn create_lease(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        duration: Duration,
    ) -> Result<bool> {
        let ttl = duration + LEASE_TTL_PAD;
        match self
            .store
            .create(&self.lease_key(ip), &mac.to_string(), Some(ttl))
            .await
        {
            Ok(()) => {
                self.write_mirror(mac, ip, ttl).await;
                self.record_assignment(mac, ip, ttl).await;
                Ok(true)
            }
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh a lease this MAC already holds. `Ok(false)` means the lease
    /// changed hands (or expired) underneath us.
    pub async fn renew_lease(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        duration: Duration,
    ) -> Result<bool> {
        let ttl = duration + LEASE_TTL_PAD;
        let holder = mac.to_string();
        match self
            .store
            .compare_and_swap(&self.lease_key(ip), &holder, Some(ttl), &holder)
            .await
        {
            Ok(()) => {
                self.write_mirror(mac, ip, ttl).await;
                Ok(true)
            }
            Err(StoreError::CasFailed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of the per-IP lease record.
    pub async fn release(&self, ip: Ipv4Addr) {
        match self.store.delete(&self.lease_key(ip), false).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!(ip = %ip, error = %e, "lease release failed"),
        }
    }

    /// Mirror the MAC→IP pointer. Failures are logged and swallowed: the
    /// per-IP record is the one that matters.
    async fn write_mirror(&self, mac: MacAddr, ip: Ipv4Addr, ttl: Duration) {
        let dir = self.mirror_key(mac);
        match self.store.mkdir(&dir, None).await {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => {
                warn!(mac = %mac, error = %e, "mirror directory create failed");
                return;
            }
        }
        if let Err(e) = self
            .store
            .set(&format!("{dir}/ip"), &ip.to_string(), Some(ttl))
            .await
        {
            warn!(mac = %mac, ip = %ip, error = %e, "mirror write failed");
        }
    }

    /// Remember a fresh dynamic grant as an assignment whose lifetime is the
    /// lease's. Reservations (and previously recorded assignments) are left
    /// untouched. Best-effort, like the mirror.
    async fn record_assignment(&self, mac: MacAddr, ip: Ipv4Addr, ttl: Duration) {
        let root = format!("{}/assignment/{}", self.mirror_key(mac), ip);
        match self.store.mkdir(&root, Some(ttl)).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => return,
            Err(e) => {
                warn!(mac = %mac, ip = %ip, error = %e, "assignment record failed");
                return;
            }
        }
        let now = chrono::Utc::now().to_rfc3339();
        for (field, value) in [
            ("mode", AssignmentMode::Dynamic.as_str()),
            ("created", now.as_str()),
            ("assigned", now.as_str()),
        ] {
            if let Err(e) = self.store.set(&format!("{root}/{field}"), value, None).await {
                warn!(mac = %mac, ip = %ip, error = %e, "assignment record failed");
                return;
            }
        }
    }

    /// Select the best address for `mac`.
    ///
    /// Preference order: reservation with an active lease held by this MAC,
    /// reservation without a lease, in-pool dynamic assignment with a lease
    /// held by this MAC, in-pool dynamic assignment without a lease, then a
    /// fresh address from the pool. Candidate lease probes run in parallel
    /// and are consumed in assignment-sort order; once a winner is known the
    /// outstanding probes are aborted.
    pub async fn select(
        &self,
        binding: &Binding,
        pool: Ipv4Net,
        mac: MacAddr,
        exclude: &[Ipv4Addr],
    ) -> Result<Option<Ipv4Addr>> {
        let mut candidates = binding.assignments.clone();
        sort_assignments(&mut candidates);
        candidates.retain(|a| a.mode == AssignmentMode::Reserved || pool.contains(&a.address));

        let mut probes: Vec<JoinHandle<Result<Option<LeaseInfo>>>> = candidates
            .iter()
            .map(|a| {
                let this = self.clone();
                let ip = a.address;
                tokio::spawn(async move { this.lookup_by_ip(ip).await })
            })
            .collect();

        let mut states = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.iter().enumerate() {
            let lease = match (&mut probes[i]).await {
                Ok(result) => result?,
                Err(e) => return Err(StoreError::Transport(e.to_string()).into()),
            };
            let state = match lease {
                None => LeaseState::Free,
                Some(l) if l.holder == mac => LeaseState::HeldBySelf,
                Some(_) => LeaseState::HeldByOther,
            };
            if candidate.mode == AssignmentMode::Reserved && state == LeaseState::HeldBySelf {
                for probe in &probes[i + 1..] {
                    probe.abort();
                }
                debug!(mac = %mac, ip = %candidate.address, "selected leased reservation");
                return Ok(Some(candidate.address));
            }
            states.push(state);
        }

        let pick = |mode: AssignmentMode, state: LeaseState| {
            candidates
                .iter()
                .zip(&states)
                .find(|(a, s)| a.mode == mode && **s == state)
                .map(|(a, _)| a.address)
        };

        if let Some(ip) = pick(AssignmentMode::Reserved, LeaseState::Free) {
            debug!(mac = %mac, ip = %ip, "selected free reservation");
            return Ok(Some(ip));
        }
        if let Some(ip) = pick(AssignmentMode::Dynamic, LeaseState::HeldBySelf) {
            debug!(mac = %mac, ip = %ip, "selected leased dynamic assignment");
            return Ok(Some(ip));
        }
        if let Some(ip) = pick(AssignmentMode::Dynamic, LeaseState::Free) {
            debug!(mac = %mac, ip = %ip, "selected free dynamic assignment");
            return Ok(Some(ip));
        }

        self.scan_pool(pool, exclude).await
    }

    /// Linear scan from the pool base for an unleased address, skipping the
    /// network and broadcast addresses and the caller's exclusions.
    async fn scan_pool(&self, pool: Ipv4Net, exclude: &[Ipv4Addr]) -> Result<Option<Ipv4Addr>> {
        let broadcast = pool.broadcast();
        let mut candidate = u32::from(pool.network()).wrapping_add(1);
        loop {
            let ip = Ipv4Addr::from(candidate);
            if !pool.contains(&ip) || ip == broadcast {
                return Ok(None);
            }
            if !exclude.contains(&ip)
                && self
                    .store
                    .get(&self.lease_key(ip), false, false)
                    .await?
                    .is_none()
            {
                return Ok(Some(ip));
            }
            candidate = candidate.wrapping_add(1);
        }
    }
}
