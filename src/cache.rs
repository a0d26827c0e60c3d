//! Caching layer for coin selection
//!
//! Parsing a coin's script into asset rows is the expensive part of a
//! matrix build, and the destination-independent part of it never changes
//! for a given outpoint. The LRU below keeps those facts between builds;
//! permissions are re-applied on every build since they may change.
use crate::script::CoinFacts;
use crate::transaction::{OutPoint, TxId};
use lru::LruCache;
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub use std::hash::Hash;

/// Generic cache operations over the backing map.
pub trait CacheInner<K, V> {
    /// Retrieve a value without touching recency.
    fn get_non_mut<Q: ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq;

    fn put(&mut self, key: K, value: V);

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove<Q: ?Sized>(&mut self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq;

    /// Drops every entry whose key matches.
    fn retain_keys(&mut self, keep: &dyn Fn(&K) -> bool);
}

impl<K, V> CacheInner<K, V> for LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn get_non_mut<Q: ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.peek(key)
    }

    fn put(&mut self, key: K, value: V) {
        self.put(key, value);
    }

    fn clear(&mut self) {
        self.clear();
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn remove<Q: ?Sized>(&mut self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.pop(key)
    }

    fn retain_keys(&mut self, keep: &dyn Fn(&K) -> bool) {
        let stale: Vec<K> = self.iter().map(|(k, _)| k).filter(|k| !keep(k)).cloned().collect();
        for key in stale {
            self.pop(&key);
        }
    }
}

/// Thread-safe cache wrapper. Builds run under the wallet lock, so plain
/// blocking locks are enough here.
pub struct ThreadSafeCache<K, V, T: CacheInner<K, V>> {
    cache: Arc<RwLock<T>>,
    _phantom_k: PhantomData<K>,
    _phantom_v: PhantomData<V>,
}

impl<K, V> ThreadSafeCache<K, V, LruCache<K, V>>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new LRU cache; a zero capacity is treated as one.
    pub fn new_lru(capacity: usize) -> Self {
        let capacity_nz = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity_nz))),
            _phantom_k: PhantomData,
            _phantom_v: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.read().cap().get()
    }
}

impl<K, V, T: CacheInner<K, V>> ThreadSafeCache<K, V, T>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn get<Q: ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.cache.read().get_non_mut(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.cache.write().put(key, value);
    }

    pub fn remove<Q: ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.cache.write().remove(key)
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

impl<K, V, T: CacheInner<K, V>> Clone for ThreadSafeCache<K, V, T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            _phantom_k: PhantomData,
            _phantom_v: PhantomData,
        }
    }
}

/// Parsed coin facts keyed by outpoint.
pub type CoinSelectionCache = ThreadSafeCache<OutPoint, CoinFacts, LruCache<OutPoint, CoinFacts>>;

impl CoinSelectionCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self::new_lru(capacity)
    }

    /// Cached facts for `outpoint`, computing and storing them on a miss.
    pub fn facts_or_insert_with(
        &self,
        outpoint: &OutPoint,
        parse: impl FnOnce() -> CoinFacts,
    ) -> CoinFacts {
        if let Some(facts) = self.get(outpoint) {
            return facts;
        }
        let facts = parse();
        self.put(*outpoint, facts.clone());
        facts
    }

    /// Forgets every output of `txid`.
    pub fn invalidate_tx(&self, txid: &TxId) {
        self.cache.write().retain_keys(&|outpoint: &OutPoint| outpoint.txid != *txid);
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.len(), self.capacity())
    }
}

impl Default for CoinSelectionCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
