//! Memoization of query analysis results.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::hash::BuildHasher;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::analyzer::AnalyzedQuery;

/// Cache key for an analyzed query.
///
/// Derived from the raw query text alone: two calls with the same text but a
/// different statement kind or batch flag share one entry, and the second
/// caller sees whatever the first one computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn for_query(text: &str) -> Self {
        Self(Arc::from(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

struct Slot {
    value: Arc<AnalyzedQuery>,
    last_used: u64,
}

#[derive(Default)]
struct LruState {
    slots: HashMap<CacheKey, Slot>,
    /// `last_used` tick to key, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) -> Option<Arc<AnalyzedQuery>> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.slots.get_mut(key)?;
        let key = self.recency.remove(&slot.last_used)?;
        slot.last_used = tick;
        self.recency.insert(tick, key);
        Some(Arc::clone(&slot.value))
    }

    fn evict_oldest(&mut self) -> Option<CacheKey> {
        let (_, key) = self.recency.pop_first()?;
        self.slots.remove(key.as_str());
        Some(key)
    }

    fn insert(
        &mut self,
        capacity: usize,
        text: &str,
        value: Arc<AnalyzedQuery>,
    ) -> Arc<AnalyzedQuery> {
        if let Some(existing) = self.touch(text) {
            return existing;
        }

        while self.slots.len() >= capacity {
            match self.evict_oldest() {
                Some(evicted) => {
                    tracing::trace!(query = evicted.as_str(), "analysis cache eviction");
                }
                None => break,
            }
        }

        self.tick += 1;
        let tick = self.tick;
        let key = CacheKey::for_query(text);
        self.recency.insert(tick, key.clone());
        self.slots.insert(
            key,
            Slot {
                value: Arc::clone(&value),
                last_used: tick,
            },
        );
        value
    }
}

/// Texts per shard below which the cache keeps a single shard.
const MIN_SHARD_CAPACITY: usize = 64;
const MAX_SHARDS: usize = 16;

/// One independently locked slice of the cache with its own LRU order.
struct Shard {
    capacity: usize,
    state: Mutex<LruState>,
}

/// Bounded, least-recently-used map from query text to analysis result.
///
/// Entries are spread over up to 16 shards by a hash of the text, each with its
/// own lock and LRU order, so eviction is least-recently-used per shard. Small
/// caches use a single shard.
///
/// A lock is only held for lookups and insertions, never while computing.
/// Two callers missing on the same text may both compute; the first insert
/// wins and both get that value.
pub struct AnalysisCache {
    capacity: usize,
    shards: Box<[Shard]>,
    hasher: RandomState,
}

impl AnalysisCache {
    pub fn new(capacity: usize) -> Self {
        let count = (capacity / MIN_SHARD_CAPACITY).clamp(1, MAX_SHARDS);
        let (base, extra) = (capacity / count, capacity % count);
        let shards = (0..count)
            .map(|index| Shard {
                capacity: base + usize::from(index < extra),
                state: Mutex::new(LruState::default()),
            })
            .collect();

        Self {
            capacity,
            shards,
            hasher: RandomState::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.state.lock().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut state = shard.state.lock();
            state.slots.clear();
            state.recency.clear();
        }
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, text: &str) -> &Shard {
        let index = self.hasher.hash_one(text) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Look up a query text, marking it as most recently used.
    pub fn get(&self, text: &str) -> Option<Arc<AnalyzedQuery>> {
        self.shard(text).state.lock().touch(text)
    }

    /// Return the cached analysis for `text`, computing and storing it on a miss.
    pub fn get_or_compute<F>(&self, text: &str, compute: F) -> Arc<AnalyzedQuery>
    where
        F: FnOnce() -> AnalyzedQuery,
    {
        match self.try_get_or_compute(text, || Ok::<_, Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but a failed computation
    /// is returned to the caller and nothing is stored.
    pub fn try_get_or_compute<F, E>(
        &self,
        text: &str,
        compute: F,
    ) -> Result<Arc<AnalyzedQuery>, E>
    where
        F: FnOnce() -> Result<AnalyzedQuery, E>,
    {
        if let Some(hit) = self.get(text) {
            tracing::trace!(query = text, "analysis cache hit");
            return Ok(hit);
        }

        let computed = Arc::new(compute()?);
        let shard = self.shard(text);
        if shard.capacity == 0 {
            return Ok(computed);
        }
        Ok(shard.state.lock().insert(shard.capacity, text, computed))
    }
}

impl std::fmt::Debug for AnalysisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisCache")
            .field("capacity", &self.capacity)
            .field("shards", &self.shard_count())
            .field("len", &self.len())
            .finish()
    }
}
