//! Bounded LRU cache of downsampled series.
//!
//! Results are keyed by a caller-supplied dataset [`Fingerprint`] and the
//! requested threshold. Concurrent misses on the same key are coalesced: the
//! first caller computes, later callers subscribe to its in-flight marker and
//! share the outcome, success or failure. Unrelated keys never wait on each
//! other; the internal lock only guards map updates and is never held across
//! an `.await`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lttb;
use crate::point::Point;

/// Default maximum number of cached results.
pub const DEFAULT_CAPACITY: usize = 64;

/// Stable identity of a dataset's content or version.
///
/// Computing it is up to the caller: a content hash, or a cheap
/// identity plus version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn new(value: u64) -> Self {
        Fingerprint(value)
    }

    /// Fingerprint derived from a dataset identifier and a version counter
    /// that the owner bumps whenever the data changes.
    pub fn versioned<I: Hash + ?Sized>(id: &I, version: u64) -> Self {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        version.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Fingerprint(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub threshold: usize,
}

impl CacheKey {
    pub const fn new(fingerprint: Fingerprint, threshold: usize) -> Self {
        CacheKey {
            fingerprint,
            threshold,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.fingerprint, self.threshold)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached results. Must be at least 1.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Point-in-time counters of a [`ResultCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    /// Total points held across all entries.
    pub points: usize,
    pub hits: u64,
    pub misses: u64,
    /// Requests that attached to another caller's in-flight computation.
    pub coalesced: u64,
    pub evictions: u64,
    pub failures: u64,
}

type Outcome = Result<Arc<[Point]>>;

struct Entry {
    points: Arc<[Point]>,
    tick: u64,
}

struct State {
    capacity: usize,
    // Bumped on every insert and touch; the smallest live tick is the LRU
    // entry, and insertion order breaks what would otherwise be ties.
    tick: u64,
    entries: HashMap<CacheKey, Entry>,
    recency: BTreeMap<u64, CacheKey>,
    inflight: HashMap<CacheKey, watch::Receiver<Option<Outcome>>>,
}

impl State {
    fn new(capacity: usize) -> Self {
        State {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            inflight: HashMap::new(),
        }
    }

    fn touch(&mut self, key: &CacheKey) -> Option<Arc<[Point]>> {
        let entry = self.entries.get_mut(key)?;
        self.tick += 1;
        self.recency.remove(&entry.tick);
        entry.tick = self.tick;
        self.recency.insert(self.tick, *key);
        Some(Arc::clone(&entry.points))
    }

    fn insert(&mut self, key: CacheKey, points: Arc<[Point]>) -> Vec<CacheKey> {
        self.tick += 1;
        let entry = Entry {
            points,
            tick: self.tick,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.recency.remove(&old.tick);
        }
        self.recency.insert(self.tick, key);
        self.evict_to_capacity()
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                true
            }
            None => false,
        }
    }

    fn evict_to_capacity(&mut self) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    failures: AtomicU64,
}

/// Bounded, concurrency-safe memo of downsampling results.
///
/// Construct one per process and share it by reference (or `Arc`).
pub struct ResultCache {
    state: Mutex<State>,
    counters: Counters,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        ResultCache::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ResultCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        ResultCache::with_capacity(capacity.get())
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity)
            .ok_or_else(|| Error::invalid("cache capacity must be at least 1"))?;
        Ok(ResultCache::new(capacity))
    }

    fn with_capacity(capacity: usize) -> Self {
        ResultCache {
            state: Mutex::new(State::new(capacity)),
            counters: Counters::default(),
        }
    }

    // Every critical section leaves the state consistent, so a panic while
    // the lock was held is safe to recover from.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached result for `key`, computing it with `compute` on a
    /// miss.
    ///
    /// `compute` runs at most once per key at a time: concurrent callers for
    /// the same key wait for the running computation and receive its result.
    /// Failures are shared with those waiters and never cached, so the next
    /// request for the key starts over. If the computing caller is dropped
    /// before finishing, waiters fail with [`Error::ComputeFailure`].
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<Arc<[Point]>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Point>, E>>,
        E: Into<eyre::Report>,
    {
        self.coalesce(key, move || async move { compute().await.map_err(Error::compute) })
            .await
    }

    /// Cache-fronted [`lttb::downsample`].
    ///
    /// `fingerprint` must identify the content of `points`. Invalid input is
    /// reported as [`Error::InvalidInput`] and is never cached.
    pub async fn downsample(
        &self,
        fingerprint: Fingerprint,
        points: &[Point],
        threshold: usize,
    ) -> Result<Arc<[Point]>> {
        let key = CacheKey::new(fingerprint, threshold);
        self.coalesce(key, || async move { lttb::downsample(points, threshold) })
            .await
    }

    async fn coalesce<F, Fut>(&self, key: CacheKey, compute: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Point>>>,
    {
        let role = {
            let mut state = self.lock();
            if let Some(points) = state.touch(&key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "cache hit");
                return Ok(points);
            }
            match state.inflight.get(&key) {
                Some(rx) => Role::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.inflight.insert(key, rx);
                    Role::Compute(tx)
                }
            }
        };

        match role {
            Role::Wait(rx) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "joining in-flight computation");
                wait(rx, key).await
            }
            Role::Compute(tx) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "cache miss");
                let flight = Flight {
                    cache: self,
                    key,
                    tx: Some(tx),
                };
                let outcome: Outcome = compute().await.map(Arc::from);
                flight.land(outcome.clone());
                outcome
            }
        }
    }

    /// Returns the cached result for `key` and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<[Point]>> {
        let points = self.lock().touch(key);
        if points.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        }
        points
    }

    /// Whether `key` is cached. Does not affect recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().remove(key)
    }

    /// Drops every threshold cached for one dataset. Returns how many
    /// entries were removed.
    pub fn invalidate_fingerprint(&self, fingerprint: Fingerprint) -> usize {
        let mut state = self.lock();
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.fingerprint == fingerprint)
            .copied()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Changes the capacity, evicting least recently used entries right away
    /// if the cache is now over the limit.
    pub fn set_capacity(&self, capacity: NonZeroUsize) {
        let evicted = {
            let mut state = self.lock();
            state.capacity = capacity.get();
            state.evict_to_capacity()
        };
        self.record_evictions(&evicted);
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity, points) = {
            let state = self.lock();
            let points: usize = state.entries.values().map(|e| e.points.len()).sum();
            (state.entries.len(), state.capacity, points)
        };
        CacheStats {
            entries,
            capacity,
            points,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn record_evictions(&self, evicted: &[CacheKey]) {
        if evicted.is_empty() {
            return;
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for key in evicted {
            debug!(%key, "evicted");
        }
    }
}

enum Role {
    Wait(watch::Receiver<Option<Outcome>>),
    Compute(watch::Sender<Option<Outcome>>),
}

async fn wait(mut rx: watch::Receiver<Option<Outcome>>, key: CacheKey) -> Outcome {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone(),
        // Sender dropped without publishing: the computing caller went away.
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| Err(cancelled(key)))
}

fn cancelled(key: CacheKey) -> Error {
    Error::compute(eyre::eyre!(
        "computation for {key} was cancelled before completing"
    ))
}

// Owned by the caller that is computing a key. Publishing the outcome and
// clearing the in-flight marker happen in `land`; if the caller is dropped
// or panics first, `Drop` clears the marker and closes the channel so that
// waiters fail instead of hanging.
struct Flight<'a> {
    cache: &'a ResultCache,
    key: CacheKey,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl Flight<'_> {
    fn land(mut self, outcome: Outcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let evicted = {
            let mut state = self.cache.lock();
            state.inflight.remove(&self.key);
            match &outcome {
                Ok(points) => state.insert(self.key, Arc::clone(points)),
                Err(_) => Vec::new(),
            }
        };
        self.cache.record_evictions(&evicted);

        if let Err(err) = &outcome {
            self.cache.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %self.key, error = %err, "computation failed");
        }

        // Fails only when nobody is waiting.
        let _ = tx.send(Some(outcome));
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.cache.lock().inflight.remove(&self.key);
            self.cache.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %self.key, "computation abandoned before completing");
            drop(tx);
        }
    }
}
