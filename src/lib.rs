/*!
Sharded in-process object cache.

String keys map to opaque `Arc` value handles. Entries are bounded three
ways: by time (absolute or sliding expirations, collected by a per-shard
expiration wheel), by dependencies (change monitors that remove entries when
they fire), and by memory pressure (a statistics loop samples the host and
the cache itself and trims the least-recently-used entries of each shard's
usage ladder).

The cache is safe to share across threads; operations on the same key are
linearized by that key's shard, and background work runs on cancellable
timer threads owned by the cache.

```no_run
use std::sync::Arc;
use std::time::Duration;
use ocache::{CachePolicy, MemoryCache};

let cache = MemoryCache::new("sessions");
cache.set(
    "user:42",
    Arc::new(String::from("profile")),
    CachePolicy::default().with_sliding_expiration(Duration::from_secs(300)),
);
assert!(cache.contains("user:42"));
```
*/

mod cache;
mod entry;
mod error;
mod memory;
mod monitor;
mod policy;
mod stats;
mod store;
mod timer;

use std::any::Any;
use std::sync::Arc;

pub use cache::{default_cache, MemoryCache, MemoryCacheBuilder};
pub use entry::EntryState;
pub use error::BuildError;
pub use memory::{set_memory_cache_manager, MemoryCacheManager};
pub use monitor::{CacheEntryChangeMonitor, ChangeMonitor};
pub use policy::{
    CachePolicy, Priority, RemovedArgs, RemovedCallback, RemovedReason, UpdateArgs,
    UpdateCallback, MAX_SLIDING_EXPIRATION,
};

/// Opaque value handle. The cache never looks inside; callers downcast on
/// the way out and use the removal callback as their release hook.
pub type Value = Arc<dyn Any + Send + Sync>;

bitflags::bitflags! {
    /// What this cache implementation supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const IN_MEMORY_PROVIDER = 1 << 0;
        const CACHE_ENTRY_CHANGE_MONITORS = 1 << 1;
        const ABSOLUTE_EXPIRATIONS = 1 << 2;
        const SLIDING_EXPIRATIONS = 1 << 3;
        const CACHE_ENTRY_UPDATE_CALLBACK = 1 << 4;
        const CACHE_ENTRY_REMOVED_CALLBACK = 1 << 5;
    }
}

impl MemoryCache {
    /// Every capability flag; this implementation supports them all.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }
}
