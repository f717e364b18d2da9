//! The public cache engine: byte-bounded LRU storage, TTL expiry, and the
//! regulation/single-flight/cron machinery layered on top of it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::cron::{self, CronHandle};
use crate::entry::{unix_now, Entry};
use crate::error::{CacheError, Result};
pub use crate::error::ErrorHook;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::registry::RegulationRegistry;
use crate::single_flight::{Loader, SingleFlight};
use crate::store::Store;
use crate::value::CacheValue;

/// Callback fired whenever an entry leaves the cache because capacity was
/// exceeded (not because it was explicitly deleted or expired).
pub type EvictionHook = Arc<dyn Fn(&str, &Arc<dyn CacheValue>) + Send + Sync>;

/// Construction-time knobs for a [`Cache`].
#[derive(Clone)]
pub struct CacheConfig {
    /// Total byte budget across all keys and values. Zero means unbounded.
    pub max_bytes: usize,
    /// How often the background sweeper scans for tombstoned/expired entries.
    pub sweep_interval: Duration,
    /// How long a single-flight caller waits for a loader before getting
    /// `SlowCallTimeout`.
    pub max_wait: Duration,
    pub on_evict: Option<EvictionHook>,
    pub on_error: Option<ErrorHook>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            sweep_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(5),
            on_evict: None,
            on_error: None,
        }
    }
}

impl CacheConfig {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_on_evict(mut self, hook: EvictionHook) -> Self {
        self.on_evict = Some(hook);
        self
    }

    #[must_use]
    pub fn with_on_error(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }
}

/// A byte-bounded, TTL-aware, single-flight-coalescing in-process cache.
///
/// Construct with [`Cache::new`], which returns an `Arc<Cache>` since the
/// background sweeper and any `register_cron` refreshers hold a weak
/// reference back to the cache and need it to already be shared.
pub struct Cache {
    store: RwLock<Store>,
    registry: RegulationRegistry,
    metrics: CacheMetrics,
    max_bytes: usize,
    sweep_interval: Duration,
    on_evict: Option<EvictionHook>,
    on_error: Option<ErrorHook>,
    cron_handles: StdMutex<Vec<CronHandle>>,
    sweep_handle: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let single_flight = SingleFlight::new(config.max_wait, config.on_error.clone());
        let cache = Arc::new(Self {
            store: RwLock::new(Store::new()),
            registry: RegulationRegistry::new(single_flight),
            metrics: CacheMetrics::default(),
            max_bytes: config.max_bytes,
            sweep_interval: config.sweep_interval,
            on_evict: config.on_evict,
            on_error: config.on_error,
            cron_handles: StdMutex::new(Vec::new()),
            sweep_handle: StdMutex::new(None),
        });
        let handle = spawn_sweeper(Arc::downgrade(&cache), cache.sweep_interval);
        *cache.sweep_handle.lock().unwrap() = Some(handle);
        cache
    }

    /// Look up `key`. On a genuine miss (no live entry and no registered
    /// regulation) returns `Ok(None)`. On a hit, promotes the entry to
    /// most-recently-used and returns `Ok(Some(value))`. If `key` has no
    /// live entry but carries a registered regulation, falls through to the
    /// single-flight-coalesced loader and, for the caller that actually ran
    /// it, publishes the result into the engine before returning it — this
    /// is the only path through which `get` can return a `CacheError`.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<dyn CacheValue>>> {
        if let Some(value) = self.get_local(key).await {
            return Ok(Some(value));
        }
        let key_arc: Arc<str> = Arc::from(key);
        match self.registry.get(&key_arc).await? {
            Some((value, should_save, ttl)) => {
                if should_save {
                    self.metrics.record_loader_invocation();
                    self.set_with_ttl(key, Arc::clone(&value), ttl).await?;
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Engine-only lookup: no regulation fallback. `None` on a miss, an
    /// expired entry, or a tombstoned entry. An entry found to be newly
    /// expired is tombstoned in place and reported to `on_evict`; an
    /// already-tombstoned entry is a plain miss (its eviction callback
    /// already fired, either on `delete` or on the sweep that tombstoned it).
    async fn get_local(&self, key: &str) -> Option<Arc<dyn CacheValue>> {
        let mut store = self.store.write().await;
        let idx = store.get_index(key)?;
        let now = unix_now();
        if store.entry(idx).status == crate::entry::Status::Deleted {
            self.metrics.record_miss();
            return None;
        }
        if store.entry(idx).is_expired_at(now) {
            let entry = store.entry_mut(idx);
            entry.mark_deleted();
            let key = Arc::clone(&entry.key);
            let value = Arc::clone(&entry.value);
            if let Some(hook) = &self.on_evict {
                hook(&key, &value);
            }
            self.metrics.record_expiration();
            self.metrics.record_miss();
            return None;
        }
        let value = Arc::clone(&store.entry(idx).value);
        store.promote(idx);
        self.metrics.record_hit();
        Some(value)
    }

    /// Insert or overwrite `key` with no expiry.
    pub async fn set(&self, key: &str, value: Arc<dyn CacheValue>) -> Result<()> {
        self.set_with_ttl(key, value, 0).await
    }

    /// Insert only if `key` is absent (or tombstoned/expired). Racy by
    /// construction: two concurrent callers can both observe "absent" and
    /// both write; the last write under the store's lock wins. Callers that
    /// need atomic create-or-fail semantics should route through
    /// `register`/`get` instead.
    pub async fn set_if_absent(&self, key: &str, value: Arc<dyn CacheValue>, ttl_secs: u64) -> Result<()> {
        let mut store = self.store.write().await;
        if let Some(idx) = store.get_index(key) {
            let now = unix_now();
            let entry = store.entry(idx);
            if !entry.is_expired_at(now) && entry.status == crate::entry::Status::Normal {
                return Err(CacheError::KeyAlreadyExists);
            }
        }
        drop(store);
        self.set_with_ttl(key, value, ttl_secs).await
    }

    /// Overwrite only if `key` is already present and live; errors if absent.
    pub async fn replace_existing(&self, key: &str, value: Arc<dyn CacheValue>, ttl_secs: u64) -> Result<()> {
        {
            let store = self.store.read().await;
            match store.get_index(key) {
                Some(idx) => {
                    let now = unix_now();
                    let entry = store.entry(idx);
                    if entry.is_expired_at(now) || entry.status == crate::entry::Status::Deleted {
                        return Err(CacheError::KeyNotExists);
                    }
                }
                None => return Err(CacheError::KeyNotExists),
            }
        }
        self.set_with_ttl(key, value, ttl_secs).await
    }

    pub async fn set_with_ttl(&self, key: &str, value: Arc<dyn CacheValue>, ttl_secs: u64) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidParam("key must not be empty".into()));
        }
        let charge = key.len() + value.len();
        if self.max_bytes > 0 && charge > self.max_bytes {
            return Err(CacheError::ValueLargerThanCapacity);
        }

        let mut store = self.store.write().await;
        if let Some(idx) = store.get_index(key) {
            let old_charge = store.entry(idx).charge();
            store.entry_mut(idx).reuse(value, ttl_secs);
            let new_charge = store.entry(idx).charge();
            store.adjust_bytes(new_charge as i64 - old_charge as i64);
            store.promote(idx);
        } else {
            let entry = Entry::new(Arc::from(key), value, ttl_secs);
            let added = entry.charge();
            store.insert_new(entry);
            store.adjust_bytes(added as i64);
        }

        self.evict_to_capacity(&mut store);
        Ok(())
    }

    /// Update only the expiry of an already-present key. A no-op, not an
    /// error, if `key` is absent.
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut store = self.store.write().await;
        if let Some(idx) = store.get_index(key) {
            store.entry_mut(idx).set_expire_at(ttl_secs);
        }
        Ok(())
    }

    /// Tombstone `key`. Idempotent: deleting an absent or already-deleted key
    /// is not an error, it just returns `false`. A live key being tombstoned
    /// fires `on_evict` — the node stays in the list and map until the
    /// sweeper reclaims it.
    pub async fn delete(&self, key: &str) -> bool {
        let mut store = self.store.write().await;
        let Some(idx) = store.get_index(key) else {
            return false;
        };
        let was_live = store.entry(idx).status == crate::entry::Status::Normal;
        if was_live {
            let entry = store.entry_mut(idx);
            entry.mark_deleted();
            let key = Arc::clone(&entry.key);
            let value = Arc::clone(&entry.value);
            if let Some(hook) = &self.on_evict {
                hook(&key, &value);
            }
            self.metrics.record_invalidation();
        }
        was_live
    }

    /// Register a key's loader and default TTL with the regulation registry.
    pub async fn register(&self, key: impl Into<Arc<str>>, default_ttl_secs: u64, loader: Loader) -> Result<()> {
        self.registry.register(key.into(), default_ttl_secs, loader).await
    }

    /// Register a periodic refresher for `key`. `key` must not already carry
    /// a regulation (`register`'s catalog and cron's catalog are the same
    /// namespace). The loader runs once immediately, then again every
    /// `period`, unconditionally overwriting `key` with a TTL of `0` (no
    /// expiry — the refresher itself keeps the value current).
    ///
    /// Takes `&Arc<Self>` rather than `&self`: the refresher needs to call
    /// back into `set_with_ttl` from a detached task, which means it needs
    /// its own strong handle on the cache.
    pub async fn register_cron(
        self: &Arc<Self>,
        key: impl Into<Arc<str>>,
        period: Duration,
        loader: Loader,
    ) -> Result<()> {
        let key: Arc<str> = key.into();
        if key.is_empty() {
            return Err(CacheError::InvalidParam("key must not be empty".into()));
        }
        if self.registry.contains(&key).await {
            return Err(CacheError::KeyAlreadyExists);
        }

        let on_error = self.on_error.clone();
        let cache_for_success = Arc::clone(self);
        let handle = cron::spawn(
            key,
            period,
            loader,
            move |k, v| {
                let cache = Arc::clone(&cache_for_success);
                Box::pin(async move {
                    cache.metrics.record_loader_invocation();
                    if let Err(e) = cache.set_with_ttl(&k, v, 0).await {
                        error!(key = %k, error = %e, "cron refresher produced a value the cache rejected");
                    }
                })
            },
            move |k, e| {
                if let Some(cb) = &on_error {
                    cb(k.clone(), e.clone());
                } else {
                    error!(key = %k, error = %e, "cron refresher failed");
                }
            },
        );
        self.cron_handles.lock().unwrap().push(handle);
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn used_bytes(&self) -> usize {
        self.store.read().await.used_bytes()
    }

    /// Evict least-recently-used entries until `used_bytes` is within budget.
    /// Called with the store's write lock already held.
    fn evict_to_capacity(&self, store: &mut Store) {
        if self.max_bytes == 0 {
            return;
        }
        while store.used_bytes() > self.max_bytes {
            let Some(idx) = store.tail_index() else { break };
            let removed = store.remove_index(idx);
            store.adjust_bytes(-(removed.charge() as i64));
            if let Some(hook) = &self.on_evict {
                hook(&removed.key, &removed.value);
            }
            self.metrics.record_eviction();
            debug!(key = %removed.key, "evicted entry to stay within capacity");
        }
    }

    /// Walk every slot once. An already-tombstoned entry is physically
    /// unlinked, removed from the map, and its charge subtracted — this is
    /// the only place a `Deleted` entry is actually reclaimed. A still-Normal
    /// entry found past its TTL (one nobody has read since it expired) is
    /// tombstoned in place and reported to `on_evict`, to be reclaimed on a
    /// later sweep. Runs on the background sweep interval rather than on
    /// every read, so a read never pays for reclaiming someone else's expired
    /// key.
    async fn sweep(&self) {
        let now = unix_now();
        let mut store = self.store.write().await;
        let indices: Vec<usize> = store.iter_indices().collect();
        let mut reclaimed = 0usize;
        let mut newly_expired = 0usize;
        for idx in indices {
            match store.entry(idx).status {
                crate::entry::Status::Deleted => {
                    let removed = store.remove_index(idx);
                    store.adjust_bytes(-(removed.charge() as i64));
                    reclaimed += 1;
                }
                crate::entry::Status::Normal if store.entry(idx).is_expired_at(now) => {
                    let entry = store.entry_mut(idx);
                    entry.mark_deleted();
                    let key = Arc::clone(&entry.key);
                    let value = Arc::clone(&entry.value);
                    if let Some(hook) = &self.on_evict {
                        hook(&key, &value);
                    }
                    self.metrics.record_expiration();
                    newly_expired += 1;
                }
                crate::entry::Status::Normal => {}
            }
        }
        if reclaimed > 0 || newly_expired > 0 {
            debug!(reclaimed, newly_expired, "sweep cycle reclaimed and tombstoned entries");
        }
    }
}

fn spawn_sweeper(cache: std::sync::Weak<Cache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick; sweeping an empty cache is pointless
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                info!("cache dropped, stopping sweeper");
                break;
            };
            cache.sweep().await;
        }
    })
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
        for handle in self.cron_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
