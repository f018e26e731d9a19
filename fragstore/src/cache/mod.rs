//! Keyed cache engine
//!
//! Responsibilities:
//! - One expiring LRU engine (`KeyedCache`) backed by `moka::future::Cache`.
//! - Key derivation, loading and narrowing are pluggable through the
//!   `KeyOf` / `Load` / `Narrow` capability traits.
//!
//! Concurrent misses on one key may both load; the later insert wins. Failed
//! loads are never cached.
//!
//! Submodules:
//! - `policies`: the metadata / range / mapping / block instances
pub mod policies;

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;

use crate::config::CachePolicy;
use crate::error::Result;

/// Derives the cache key for a request.
pub trait KeyOf<P: ?Sized, K>: Send + Sync {
    fn key_of(&self, params: &P) -> K;
}

impl<P: ?Sized, K, F> KeyOf<P, K> for F
where
    F: Fn(&P) -> K + Send + Sync,
{
    fn key_of(&self, params: &P) -> K {
        self(params)
    }
}

/// Loads the value for a missed key.
#[async_trait]
pub trait Load<P: Send + Sync, V>: Send + Sync {
    async fn load(&self, params: &P) -> Result<V>;
}

/// Serves the requested part of a cached value; `None` when nothing overlaps.
pub trait Narrow<P: ?Sized, V>: Send + Sync {
    fn narrow(&self, params: &P, value: &V) -> Option<V>;
}

impl<P: ?Sized, V, F> Narrow<P, V> for F
where
    F: Fn(&P, &V) -> Option<V> + Send + Sync,
{
    fn narrow(&self, params: &P, value: &V) -> Option<V> {
        self(params, value)
    }
}

/// Returns the cached value as is.
pub struct Whole;

impl<P: ?Sized, V: Clone> Narrow<P, V> for Whole {
    fn narrow(&self, _params: &P, value: &V) -> Option<V> {
        Some(value.clone())
    }
}

pub struct KeyedCache<P: Send + Sync, K, V> {
    name: &'static str,
    inner: Cache<K, V>,
    key_of: Arc<dyn KeyOf<P, K>>,
    loader: Arc<dyn Load<P, V>>,
    narrow: Arc<dyn Narrow<P, V>>,
    loads: AtomicUsize,
}

impl<P, K, V> KeyedCache<P, K, V>
where
    P: Send + Sync,
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        policy: CachePolicy,
        key_of: Arc<dyn KeyOf<P, K>>,
        loader: Arc<dyn Load<P, V>>,
        narrow: Arc<dyn Narrow<P, V>>,
    ) -> Self {
        let inner = Cache::builder()
            .name(name)
            .max_capacity(policy.capacity)
            .time_to_live(policy.ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            name,
            inner,
            key_of,
            loader,
            narrow,
            loads: AtomicUsize::new(0),
        }
    }

    /// Cached lookup; loads the key on a miss.
    pub async fn get(&self, params: &P) -> Result<Option<V>> {
        let key = self.key_of.key_of(params);
        if let Some(value) = self.inner.get(&key).await {
            tracing::trace!(cache = self.name, "hit");
            return Ok(self.narrow.narrow(params, &value));
        }
        self.load_into(key, params).await
    }

    /// Forced reload, replacing whatever is cached for the key.
    pub async fn miss(&self, params: &P) -> Result<Option<V>> {
        let key = self.key_of.key_of(params);
        self.load_into(key, params).await
    }

    async fn load_into(&self, key: K, params: &P) -> Result<Option<V>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache = self.name, "miss");
        let value = self.loader.load(params).await?;
        let narrowed = self.narrow.narrow(params, &value);
        self.inner.insert(key, value).await;
        Ok(narrowed)
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    /// Drops every entry whose key matches `pred`.
    pub async fn invalidate_matching<F>(&self, pred: F)
    where
        F: Fn(&K) -> bool,
    {
        let doomed: Vec<Arc<K>> = self
            .inner
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k)
            .collect();
        for k in doomed {
            self.inner.invalidate(k.as_ref()).await;
        }
    }

    /// Number of loader invocations so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub async fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}
