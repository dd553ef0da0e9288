//! Proactive response cache.
//!
//! One task owns the cache map; everything else talks to it over channels
//! (requests, fetch responses, timer expirations, clear, stop), so hit
//! counting, coalescing, and refresh decisions all happen in one
//! single-threaded region. Hits are served with their TTLs decremented by
//! the entry's age. A miss spawns one fetch and parks every concurrent
//! requester for the same question on it. An entry that was hit since its
//! last refresh is refetched in the background before it expires, so hot
//! answers stay warm.

use async_trait::async_trait;
use hickory_proto::rr::Record;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::entry::Question;

/// What kind of event triggered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An external query missed the cache.
    Query,
    /// A proactive refresh of a hot entry.
    Renewal,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Query => f.write_str("query"),
            Event::Renewal => f.write_str("renewal"),
        }
    }
}

/// Context handed to the lookup function behind the cache.
#[derive(Debug, Clone, Copy)]
pub struct LookupContext {
    pub event: Event,
    pub start: Instant,
}

/// The lookup function the cache falls back to.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, ctx: LookupContext, question: Question) -> Vec<Record>;
}

/// An external request into the cache.
struct CacheRequest {
    question: Question,
    start: Option<Instant>,
    respond: oneshot::Sender<Vec<Record>>,
}

/// A completed fetch (or an explicit insert).
struct CacheResponse {
    question: Question,
    records: Vec<Record>,
}

struct CacheEntry {
    expiration: Instant,
    creation: Instant,
    hit_count: u64,
    timer: JoinHandle<()>,
    records: Vec<Record>,
}

/// Handle to the cache owner task.
#[derive(Clone)]
pub struct DnsCache {
    request_tx: mpsc::Sender<CacheRequest>,
    response_tx: mpsc::Sender<CacheResponse>,
    expiration_tx: mpsc::Sender<Question>,
    clear_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<()>,
}

const CHANNEL_DEPTH: usize = 512;

impl DnsCache {
    /// Start the owner task.
    ///
    /// `cache_max_ttl` caps how long any answer is held; `cache_miss_ttl`
    /// bounds negative caching of empty answers.
    pub fn new(
        cache_max_ttl: Duration,
        cache_miss_ttl: Duration,
        resolver: Arc<dyn Resolve>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (expiration_tx, expiration_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (clear_tx, clear_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let owner = Owner {
            cache_max_ttl,
            cache_miss_ttl,
            resolver,
            response_tx: response_tx.clone(),
            expiration_tx: expiration_tx.clone(),
            data: HashMap::new(),
            pending: HashMap::new(),
        };
        tokio::spawn(owner.run(request_rx, response_rx, expiration_rx, clear_rx, stop_rx));

        Self {
            request_tx,
            response_tx,
            expiration_tx,
            clear_tx,
            stop_tx,
        }
    }

    /// Answer a question from the cache, fetching through the resolver on a
    /// miss. Returns `None` only when the cache has been stopped.
    pub async fn lookup(&self, question: Question, start: Option<Instant>) -> Option<Vec<Record>> {
        let (respond, rx) = oneshot::channel();
        self.request_tx
            .send(CacheRequest {
                question,
                start,
                respond,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Install records as the answer to a question.
    pub async fn insert(&self, question: Question, records: Vec<Record>) {
        let _ = self.response_tx.send(CacheResponse { question, records }).await;
    }

    /// Drop any cached answer for a question.
    pub async fn expire(&self, question: Question) {
        let _ = self.expiration_tx.send(question).await;
    }

    /// Drop every cached answer. In-flight fetches stay alive.
    pub async fn clear(&self) {
        let _ = self.clear_tx.send(()).await;
    }

    /// Shut the owner task down. Pending requesters are abandoned.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

struct Owner {
    cache_max_ttl: Duration,
    cache_miss_ttl: Duration,
    resolver: Arc<dyn Resolve>,
    response_tx: mpsc::Sender<CacheResponse>,
    expiration_tx: mpsc::Sender<Question>,
    data: HashMap<Question, CacheEntry>,
    pending: HashMap<Question, Vec<oneshot::Sender<Vec<Record>>>>,
}

impl Owner {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<CacheRequest>,
        mut response_rx: mpsc::Receiver<CacheResponse>,
        mut expiration_rx: mpsc::Receiver<Question>,
        mut clear_rx: mpsc::Receiver<()>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(request) = request_rx.recv() => self.on_request(request),
                Some(response) = response_rx.recv() => self.on_response(response),
                Some(question) = expiration_rx.recv() => self.on_expiration(question),
                Some(()) = clear_rx.recv() => self.on_clear(),
                _ = stop_rx.recv() => {
                    for entry in self.data.values() {
                        entry.timer.abort();
                    }
                    return;
                }
            }
        }
    }

    fn on_request(&mut self, request: CacheRequest) {
        let now = Instant::now();
        let question = request.question.clone();

        if let Some(entry) = self.data.get_mut(&question) {
            if entry.expiration > now {
                let elapsed = now - entry.creation;
                entry.hit_count += 1;
                if entry.hit_count == 1 {
                    // First hit since the last refresh: move the timer to
                    // the midpoint of the remaining lifetime so renewal
                    // lands before expiry.
                    let duration = entry.expiration - entry.creation;
                    let refresh = refresh_delay(duration, elapsed);
                    entry.timer.abort();
                    entry.timer =
                        spawn_timer(refresh, question.clone(), self.expiration_tx.clone());
                }
                let mut records = entry.records.clone();
                elapse_ttls(&mut records, elapsed.as_secs() as u32);
                debug!(question = %question, hits = entry.hit_count, "cache hit");
                let _ = request.respond.send(records);
                return;
            }
        }

        // Miss (or expired): coalesce onto any in-flight fetch.
        let running = self.pending.contains_key(&question);
        self.pending
            .entry(question.clone())
            .or_default()
            .push(request.respond);
        if !running {
            debug!(question = %question, "cache miss, fetching");
            let start = request.start.unwrap_or(now);
            self.spawn_fetch(Event::Query, start, question);
        }
    }

    fn on_response(&mut self, response: CacheResponse) {
        let now = Instant::now();
        let question = response.question;
        let duration = cache_duration(&response.records, self.cache_max_ttl, self.cache_miss_ttl);

        if duration > Duration::ZERO {
            let timer = spawn_timer(duration, question.clone(), self.expiration_tx.clone());
            if let Some(old) = self.data.insert(
                question.clone(),
                CacheEntry {
                    expiration: now + duration,
                    creation: now,
                    hit_count: 0,
                    timer,
                    records: response.records.clone(),
                },
            ) {
                old.timer.abort();
            }
        }

        if let Some(waiters) = self.pending.remove(&question) {
            for waiter in waiters {
                let _ = waiter.send(response.records.clone());
            }
        }
    }

    fn on_expiration(&mut self, question: Question) {
        let now = Instant::now();
        let Some(entry) = self.data.get_mut(&question) else {
            return;
        };

        let hit_since_refresh = entry.hit_count > 0;
        if entry.expiration > now {
            let remaining = entry.expiration - now;
            entry.timer.abort();
            entry.timer = spawn_timer(remaining, question.clone(), self.expiration_tx.clone());
        } else {
            entry.timer.abort();
            self.data.remove(&question);
        }

        if hit_since_refresh && !self.pending.contains_key(&question) {
            debug!(question = %question, "proactive renewal");
            self.pending.insert(question.clone(), Vec::new());
            self.spawn_fetch(Event::Renewal, now, question);
        }
    }

    fn on_clear(&mut self) {
        for entry in self.data.values() {
            entry.timer.abort();
        }
        self.data.clear();
    }

    fn spawn_fetch(&self, event: Event, start: Instant, question: Question) {
        let resolver = self.resolver.clone();
        let response_tx = self.response_tx.clone();
        tokio::spawn(async move {
            let ctx = LookupContext { event, start };
            let records = resolver.resolve(ctx, question.clone()).await;
            let _ = response_tx.send(CacheResponse { question, records }).await;
        });
    }
}

fn spawn_timer(
    delay: Duration,
    question: Question,
    expiration_tx: mpsc::Sender<Question>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = expiration_tx.send(question).await;
    })
}

/// Subtract the elapsed seconds from each record's TTL, floored at zero.
fn elapse_ttls(records: &mut [Record], seconds: u32) {
    for record in records {
        let ttl = record.ttl();
        record.set_ttl(ttl.saturating_sub(seconds));
    }
}

/// How long a fetched answer should be held.
fn cache_duration(records: &[Record], max: Duration, miss: Duration) -> Duration {
    if records.is_empty() {
        return max.min(miss);
    }
    let min_ttl = records.iter().map(Record::ttl).min().unwrap_or(0);
    Duration::from_secs(u64::from(min_ttl)).min(max)
}

/// When to refresh after the first hit: halfway through the remaining
/// lifetime, unless less than a second remains.
fn refresh_delay(duration: Duration, elapsed: Duration) -> Duration {
    let remaining = duration.saturating_sub(elapsed);
    if remaining >= Duration::from_secs(1) {
        remaining / 2
    } else {
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        renewals: AtomicUsize,
        records: Vec<Record>,
    }

    impl CountingResolver {
        fn new(records: Vec<Record>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                renewals: AtomicUsize::new(0),
                records,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn resolve(&self, ctx: LookupContext, _question: Question) -> Vec<Record> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.event == Event::Renewal {
                self.renewals.fetch_add(1, Ordering::SeqCst);
            }
            self.records.clone()
        }
    }

    fn a_record(ttl: u32) -> Record {
        Record::from_rdata(
            Name::from_str("www.example.").unwrap(),
            ttl,
            RData::A(A("1.2.3.4".parse().unwrap())),
        )
    }

    fn question() -> Question {
        Question::new("www.example.", RecordType::A)
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_then_hit() {
        let resolver = CountingResolver::new(vec![a_record(100)]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        let first = cache.lookup(question(), None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(resolver.calls(), 1);

        let second = cache.lookup(question(), None).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_decrements_ttl_by_age() {
        let resolver = CountingResolver::new(vec![a_record(100)]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        cache.lookup(question(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;

        let hit = cache.lookup(question(), None).await.unwrap();
        assert_eq!(hit[0].ttl(), 60);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_then_lookup_returns_copy() {
        let resolver = CountingResolver::new(vec![]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        cache.insert(question(), vec![a_record(100)]).await;
        // Let the owner process the insert.
        tokio::task::yield_now().await;

        let hit = cache.lookup(question(), None).await.unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_refetched() {
        let resolver = CountingResolver::new(vec![a_record(50)]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        cache.lookup(question(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        cache.lookup(question(), None).await.unwrap();
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_answer_cached() {
        let resolver = CountingResolver::new(vec![]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        let miss = cache.lookup(question(), None).await.unwrap();
        assert!(miss.is_empty());
        assert_eq!(resolver.calls(), 1);

        // Within the miss window the empty answer is served from cache.
        tokio::time::sleep(Duration::from_secs(10)).await;
        cache.lookup(question(), None).await.unwrap();
        assert_eq!(resolver.calls(), 1);

        // After it, the resolver is asked again.
        tokio::time::sleep(Duration::from_secs(30)).await;
        cache.lookup(question(), None).await.unwrap();
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_entry_renewed_proactively() {
        let resolver = CountingResolver::new(vec![a_record(100)]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        cache.lookup(question(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // First hit re-arms the timer to the midpoint of the remaining 90s.
        cache.lookup(question(), None).await.unwrap();
        assert_eq!(resolver.calls(), 1);

        // At the midpoint the renewal fires in the background.
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(resolver.calls(), 2);
        assert_eq!(resolver.renewals.load(Ordering::SeqCst), 1);

        // The refreshed entry serves full-TTL hits without another fetch.
        let hit = cache.lookup(question(), None).await.unwrap();
        assert_eq!(resolver.calls(), 2);
        assert!(hit[0].ttl() > 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_entry_not_renewed() {
        let resolver = CountingResolver::new(vec![a_record(50)]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        cache.lookup(question(), None).await.unwrap();
        // Never hit again: expiry removes it without a renewal fetch.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_coalesce() {
        struct SlowResolver {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Resolve for SlowResolver {
            async fn resolve(&self, _ctx: LookupContext, _q: Question) -> Vec<Record> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                vec![a_record(100)]
            }
        }

        let resolver = Arc::new(SlowResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        let (a, b) = tokio::join!(
            cache.lookup(question(), None),
            cache.lookup(question(), None)
        );
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_cache() {
        let resolver = CountingResolver::new(vec![a_record(100)]);
        let cache = DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            resolver.clone(),
        );

        cache.lookup(question(), None).await.unwrap();
        cache.clear().await;
        tokio::task::yield_now().await;

        cache.lookup(question(), None).await.unwrap();
        assert_eq!(resolver.calls(), 2);
    }

    #[test]
    fn test_cache_duration_rules() {
        let max = Duration::from_secs(300);
        let miss = Duration::from_secs(30);

        assert_eq!(cache_duration(&[], max, miss), miss);
        assert_eq!(cache_duration(&[], Duration::from_secs(10), miss), Duration::from_secs(10));
        assert_eq!(cache_duration(&[a_record(100)], max, miss), Duration::from_secs(100));
        assert_eq!(
            cache_duration(&[a_record(100), a_record(40)], max, miss),
            Duration::from_secs(40)
        );
        assert_eq!(cache_duration(&[a_record(600)], max, miss), max);
    }

    #[test]
    fn test_refresh_delay_is_half_of_remaining() {
        assert_eq!(
            refresh_delay(Duration::from_secs(100), Duration::from_secs(20)),
            Duration::from_secs(40)
        );
        assert_eq!(
            refresh_delay(Duration::from_secs(100), Duration::from_millis(99_600)),
            Duration::from_millis(400)
        );
    }
}
