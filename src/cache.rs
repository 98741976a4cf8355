use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::entry::{now_ticks, CacheEntry};
use crate::error::BuildError;
use crate::memory::memory_cache_manager;
use crate::monitor::{CacheEntryChangeMonitor, ChangeMonitor};
use crate::policy::{CachePolicy, Priority, RemovedArgs, RemovedCallback, RemovedReason, UpdateArgs};
use crate::stats::CacheStatistics;
use crate::store::expires::TICKS_PER_BUCKET;
use crate::store::Shard;
use crate::timer::PeriodicCallback;
use crate::Value;

/// Key prefix of the companion entry backing an update callback.
const UPDATE_SENTINEL_PREFIX: &str = "OnUpdateSentinel";

const RESERVED_DEFAULT_NAME: &str = "default";
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(20);
const MEGABYTE: u64 = 1 << 20;

pub(crate) struct CacheInner {
    name: Arc<str>,
    shards: Vec<Arc<Shard>>,
    hasher: ahash::RandomState,
    disposed: AtomicBool,
    callbacks_on_close: bool,
    config_polling_interval: Duration,
    config_cache_memory_limit_mb: Option<u64>,
    config_physical_memory_limit_pct: Option<u32>,
    stats: Mutex<Option<CacheStatistics>>,
    expiration_timer: Mutex<Option<PeriodicCallback>>,
}

impl CacheInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn count(&self) -> usize {
        self.shards.iter().map(|s| s.count()).sum()
    }

    pub(crate) fn trim(&self, percent: usize) -> usize {
        if percent == 0 || self.disposed.load(Ordering::SeqCst) {
            return 0;
        }
        let percent = percent.min(100);
        self.shards.iter().map(|s| s.trim(percent)).sum()
    }

    fn shard(&self, key: &str) -> &Arc<Shard> {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // stop the background timers before draining so nothing races teardown
        *self.expiration_timer.lock() = None;
        *self.stats.lock() = None;
        for shard in &self.shards {
            shard.dispose(self.callbacks_on_close);
        }
        if let Some(manager) = memory_cache_manager() {
            manager.release_cache(&self.name);
        }
        tracing::debug!(name = %self.name, "cache closed");
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sharded in-process object cache. Keys are strings, values are opaque
/// `Arc` handles; entries are bounded by absolute or sliding expirations,
/// change-monitor dependencies, and memory-pressure trimming.
///
/// Handles are cheap to clone and share one cache.
///
/// ```no_run
/// use std::sync::Arc;
/// use ocache::{CachePolicy, MemoryCache};
///
/// let cache = MemoryCache::new("responses");
/// cache.set("greeting", Arc::new("hello".to_string()), CachePolicy::default());
/// let value = cache.get("greeting").unwrap();
/// assert_eq!(value.downcast_ref::<String>().unwrap(), "hello");
/// ```
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<CacheInner>,
}

static DEFAULT_CACHE: Lazy<MemoryCache> = Lazy::new(|| {
    MemoryCacheBuilder::new(RESERVED_DEFAULT_NAME)
        .build_internal(true)
        .expect("default cache configuration is valid")
});

/// The lazily created process-wide cache named `"default"`.
pub fn default_cache() -> &'static MemoryCache {
    &DEFAULT_CACHE
}

/// Empty keys are caller bugs, not runtime conditions.
fn validate_key(key: &str) {
    if key.is_empty() {
        panic!("cache key must not be empty");
    }
}

impl MemoryCache {
    /// A cache with default configuration. Panics on a reserved or empty
    /// name; use [`MemoryCache::builder`] for fallible construction and
    /// tuning.
    #[must_use]
    pub fn new(name: &str) -> MemoryCache {
        match MemoryCacheBuilder::new(name).build() {
            Ok(cache) => cache,
            Err(e) => panic!("invalid cache name: {e}"),
        }
    }

    #[must_use]
    pub fn builder(name: &str) -> MemoryCacheBuilder {
        MemoryCacheBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Effective cache size cap in bytes, 0 when uncapped.
    pub fn cache_memory_limit(&self) -> u64 {
        if let Some(stats) = self.inner.stats.lock().as_ref() {
            return stats.core().cache_mon.limit_bytes();
        }
        self.inner
            .config_cache_memory_limit_mb
            .map(|mb| mb * MEGABYTE)
            .unwrap_or(0)
    }

    /// Physical memory load percentage that triggers trimming.
    pub fn physical_memory_limit(&self) -> u32 {
        if let Some(stats) = self.inner.stats.lock().as_ref() {
            return stats.core().physical.pressure_high() as u32;
        }
        self.inner.config_physical_memory_limit_pct.unwrap_or(0)
    }

    /// Current statistics polling interval; shrinks under pressure.
    pub fn polling_interval(&self) -> Duration {
        if let Some(stats) = self.inner.stats.lock().as_ref() {
            return stats.polling_interval();
        }
        self.inner.config_polling_interval
    }

    pub fn count(&self) -> usize {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return 0;
        }
        self.inner.count()
    }

    pub fn contains(&self, key: &str) -> bool {
        validate_key(key);
        if self.inner.disposed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.shard(key).contains(key)
    }

    /// Returns the live value for `key`, advancing its sliding expiration
    /// and usage standing as a side effect.
    pub fn get(&self, key: &str) -> Option<Value> {
        validate_key(key);
        if self.inner.disposed.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.shard(key).get(key, true).map(|e| e.value())
    }

    /// Fetch several keys at once; absent or expired keys are simply left
    /// out of the result. Unlike [`get`](MemoryCache::get) this is a pure
    /// observer and does not advance sliding expirations or usage.
    pub fn get_values<'a, I>(&self, keys: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut values = HashMap::new();
        if self.inner.disposed.load(Ordering::SeqCst) {
            return values;
        }
        for key in keys {
            validate_key(key);
            if let Some(entry) = self.inner.shard(key).get(key, false) {
                values.insert(key.to_string(), entry.value());
            }
        }
        values
    }

    /// Atomic add-or-get: inserts `value` when no live entry exists and
    /// returns `None`, otherwise returns the incumbent's value untouched.
    /// The unused new value simply drops with the caller's handle.
    pub fn add_or_get_existing(
        &self,
        key: &str,
        value: Value,
        policy: CachePolicy,
    ) -> Option<Value> {
        validate_key(key);
        policy.validate();
        if policy.update_callback.is_some() {
            panic!("update callbacks are not supported by add_or_get_existing");
        }
        if self.inner.disposed.load(Ordering::SeqCst) {
            return None;
        }
        let entry = self.build_entry(key, value, policy);
        self.inner
            .shard(key)
            .add_or_get_existing(entry)
            .map(|e| e.value())
    }

    /// Unconditional insert-or-replace.
    pub fn set(&self, key: &str, value: Value, policy: CachePolicy) {
        validate_key(key);
        policy.validate();
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if policy.update_callback.is_some() {
            self.set_with_update_callback(key, value, policy);
            return;
        }
        let entry = self.build_entry(key, value, policy);
        self.inner.shard(key).set(entry);
    }

    /// Removes `key` and returns its value, releasing the entry with
    /// [`RemovedReason::Removed`].
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.remove_with_reason(key, RemovedReason::Removed)
    }

    pub fn remove_with_reason(&self, key: &str, reason: RemovedReason) -> Option<Value> {
        validate_key(key);
        if self.inner.disposed.load(Ordering::SeqCst) {
            return None;
        }
        self.inner
            .shard(key)
            .remove(key, None, reason)
            .map(|e| e.value())
    }

    /// Flush expired entries, then evict up to `percent` of each shard's
    /// least-used entries. Returns how many entries were removed.
    pub fn trim(&self, percent: usize) -> usize {
        self.inner.trim(percent)
    }

    /// A composite monitor over `keys` that fires once when any watched
    /// entry leaves the cache. A key that is absent right now counts as
    /// already changed.
    pub fn create_cache_entry_change_monitor<'a, I>(&self, keys: I) -> CacheEntryChangeMonitor
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| {
                validate_key(key);
                key.to_string()
            })
            .collect();
        if keys.is_empty() {
            panic!("a change monitor needs at least one key");
        }
        let disposed = self.inner.disposed.load(Ordering::SeqCst);
        let resolved = keys
            .into_iter()
            .map(|key| {
                let entry = if disposed {
                    None
                } else {
                    self.inner.shard(&key).get(&key, false)
                };
                (key, entry)
            })
            .collect();
        CacheEntryChangeMonitor::new(resolved)
    }

    /// Stops background work, drains every shard, and reports release to
    /// the process-wide manager. Removal callbacks are suppressed unless
    /// the builder enabled teardown callbacks. Idempotent; later
    /// operations are no-ops returning absent.
    pub fn close(&self) {
        self.inner.close();
    }

    fn build_entry(&self, key: &str, value: Value, policy: CachePolicy) -> Arc<CacheEntry> {
        CacheEntry::new(
            Arc::from(key),
            value,
            now_ticks(),
            policy.absolute_expiration,
            policy.sliding_expiration,
            policy.priority,
            policy.removed_callback,
            policy.change_monitors,
        )
    }

    /// The update-callback feature stores a pair: the real entry, pinned
    /// and unexpiring, and a sentinel keyed by prefix + key that carries
    /// the requested expiration. The sentinel's own removal is what fires
    /// the user's callback, giving it a chance to refresh the real value
    /// before anyone observes a miss.
    fn set_with_update_callback(&self, key: &str, value: Value, policy: CachePolicy) {
        let update_callback = policy
            .update_callback
            .clone()
            .expect("checked by the caller");
        let real = CacheEntry::new(
            Arc::from(key),
            value,
            now_ticks(),
            None,
            Duration::ZERO,
            Priority::NotRemovable,
            None,
            Vec::new(),
        );
        self.inner.shard(key).set(real.clone());

        // the sentinel depends on the entry it guards, so removing the real
        // entry tears the sentinel down too
        let dependency = Arc::new(self.create_cache_entry_change_monitor([key]));
        let mut monitors = policy.change_monitors;
        monitors.push(dependency.clone() as Arc<dyn ChangeMonitor>);

        let handler: RemovedCallback = {
            let weak = Arc::downgrade(&self.inner);
            let key = key.to_string();
            let dependency = dependency.clone();
            Arc::new(move |args: RemovedArgs| {
                match args.reason {
                    RemovedReason::Expired => {}
                    RemovedReason::ChangeMonitorChanged => {
                        // the guarded entry itself was removed; nothing to refresh
                        if dependency.has_changed() {
                            return;
                        }
                    }
                    _ => return,
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let cache = MemoryCache { inner };
                let mut update = UpdateArgs {
                    key: key.clone(),
                    reason: args.reason,
                    updated_value: None,
                    updated_policy: None,
                };
                update_callback(&mut update);
                match (update.updated_value, update.updated_policy) {
                    (Some(value), Some(policy)) if policy.is_valid() => {
                        cache.set(&key, value, policy);
                    }
                    _ => {
                        cache.remove(&key);
                    }
                }
            })
        };

        let sentinel_key = format!("{UPDATE_SENTINEL_PREFIX}{key}");
        let sentinel_shard = self.inner.shard(&sentinel_key).clone();
        let sentinel = CacheEntry::new(
            Arc::from(sentinel_key.as_str()),
            Arc::new(()) as Value,
            now_ticks(),
            policy.absolute_expiration,
            policy.sliding_expiration,
            Priority::NotRemovable,
            Some(handler),
            monitors,
        );
        sentinel_shard.set(sentinel.clone());
        real.configure_update_sentinel(sentinel_shard, Arc::downgrade(&sentinel));
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.inner.name())
            .field("count", &self.count())
            .finish()
    }
}

/// Configures and builds a [`MemoryCache`], mirroring the host-config knobs
/// of the statistics loop plus embedding switches for the background work.
pub struct MemoryCacheBuilder {
    name: String,
    cache_memory_limit_mb: Option<u64>,
    physical_memory_limit_pct: Option<u32>,
    polling_interval: Duration,
    shard_count: Option<usize>,
    expiration_interval: Duration,
    background_expiration: bool,
    memory_monitoring: bool,
    block_inserts_during_flush: bool,
    callbacks_on_close: bool,
}

impl MemoryCacheBuilder {
    #[must_use]
    pub fn new(name: &str) -> MemoryCacheBuilder {
        MemoryCacheBuilder {
            name: name.to_string(),
            cache_memory_limit_mb: None,
            physical_memory_limit_pct: None,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            shard_count: None,
            expiration_interval: Duration::from_millis(TICKS_PER_BUCKET),
            background_expiration: true,
            memory_monitoring: true,
            block_inserts_during_flush: false,
            callbacks_on_close: false,
        }
    }

    /// Absolute cap on the cache's approximate size, in megabytes. Unset
    /// derives a cap from RAM and pointer width.
    #[must_use]
    pub fn cache_memory_limit_megabytes(mut self, megabytes: u64) -> Self {
        self.cache_memory_limit_mb = Some(megabytes);
        self
    }

    /// Physical memory load percentage used as the trim trigger instead of
    /// the RAM-derived default.
    #[must_use]
    pub fn physical_memory_limit_percentage(mut self, percentage: u32) -> Self {
        self.physical_memory_limit_pct = Some(percentage);
        self
    }

    /// Base statistics polling interval (default 20 s); the loop shortens
    /// it under pressure and restores it when idle.
    #[must_use]
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Number of shards; defaults to the logical processor count.
    #[must_use]
    pub fn shard_count(mut self, count: usize) -> Self {
        self.shard_count = Some(count);
        self
    }

    /// Period of the background expiration sweep (default 20 s, one wheel
    /// bucket). Each wheel still refuses to flush more than once a second.
    #[must_use]
    pub fn expiration_interval(mut self, interval: Duration) -> Self {
        self.expiration_interval = interval;
        self
    }

    /// Disable the background expiration sweep; expired entries are then
    /// only collected lazily and by [`MemoryCache::trim`].
    #[must_use]
    pub fn background_expiration(mut self, enabled: bool) -> Self {
        self.background_expiration = enabled;
        self
    }

    /// Disable memory-pressure monitoring and automatic trimming.
    #[must_use]
    pub fn memory_monitoring(mut self, enabled: bool) -> Self {
        self.memory_monitoring = enabled;
        self
    }

    /// Make inserts of trimmable entries wait (bounded by 10 s) while a
    /// wheel flush splices expired batches out.
    #[must_use]
    pub fn block_inserts_during_flush(mut self, enabled: bool) -> Self {
        self.block_inserts_during_flush = enabled;
        self
    }

    /// Fire removal callbacks with [`RemovedReason::Disposing`] on
    /// teardown instead of suppressing them.
    #[must_use]
    pub fn callbacks_on_close(mut self, enabled: bool) -> Self {
        self.callbacks_on_close = enabled;
        self
    }

    pub fn build(self) -> Result<MemoryCache, BuildError> {
        self.build_internal(false)
    }

    fn build_internal(self, allow_reserved_name: bool) -> Result<MemoryCache, BuildError> {
        if self.name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        if !allow_reserved_name && self.name == RESERVED_DEFAULT_NAME {
            return Err(BuildError::ReservedName);
        }
        if self.polling_interval.is_zero() {
            return Err(BuildError::InvalidPollingInterval(self.polling_interval));
        }
        if let Some(pct) = self.physical_memory_limit_pct {
            if pct == 0 || pct > 100 {
                return Err(BuildError::InvalidPhysicalMemoryLimit(pct));
            }
        }
        let shard_count = match self.shard_count {
            Some(0) => return Err(BuildError::InvalidShardCount),
            Some(n) => n,
            None => num_cpus::get().max(1),
        };
        let shards = (0..shard_count)
            .map(|_| Shard::new(self.block_inserts_during_flush))
            .collect();
        let inner = Arc::new(CacheInner {
            name: Arc::from(self.name.as_str()),
            shards,
            hasher: ahash::RandomState::new(),
            disposed: AtomicBool::new(false),
            callbacks_on_close: self.callbacks_on_close,
            config_polling_interval: self.polling_interval,
            config_cache_memory_limit_mb: self.cache_memory_limit_mb,
            config_physical_memory_limit_pct: self.physical_memory_limit_pct,
            stats: Mutex::new(None),
            expiration_timer: Mutex::new(None),
        });
        if self.background_expiration {
            let weak = Arc::downgrade(&inner);
            let timer = PeriodicCallback::start("expiration", self.expiration_interval, move || {
                if let Some(inner) = weak.upgrade() {
                    for shard in &inner.shards {
                        shard.flush_expired(true);
                    }
                }
            });
            *inner.expiration_timer.lock() = Some(timer);
        }
        if self.memory_monitoring {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            let stats = CacheStatistics::new(
                Arc::downgrade(&inner),
                self.polling_interval,
                self.cache_memory_limit_mb,
                self.physical_memory_limit_pct,
                sys.total_memory(),
            );
            *inner.stats.lock() = Some(stats);
        }
        Ok(MemoryCache { inner })
    }
}
