use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::monitor::ChangeMonitor;
use crate::Value;

/// Longest sliding expiration a policy may carry.
pub const MAX_SLIDING_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Relative weight of an entry when the cache trims under memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Eligible for usage-based eviction.
    #[default]
    Default,
    /// Never evicted by trimming; still removed by expiration or explicitly.
    NotRemovable,
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedReason {
    /// Explicitly removed or displaced by a `set`.
    Removed,
    /// Absolute or sliding deadline passed.
    Expired,
    /// Evicted by the usage trimmer under memory pressure.
    Evicted,
    /// A change monitor attached to the entry fired.
    ChangeMonitorChanged,
    /// Removed by cache-internal bookkeeping (e.g. insert on a closed cache).
    CacheSpecificEviction,
    /// The cache itself was closed with teardown callbacks enabled.
    Disposing,
}

/// Arguments handed to a removal callback, exactly once per entry.
pub struct RemovedArgs {
    pub key: String,
    pub value: Value,
    pub reason: RemovedReason,
}

/// Fired when an entry is released for any reason except cache teardown
/// (unless teardown callbacks were enabled on the builder).
pub type RemovedCallback = Arc<dyn Fn(RemovedArgs) + Send + Sync>;

/// Arguments handed to an update callback just before its entry would be
/// removed. Setting both `updated_value` and `updated_policy` replaces the
/// entry instead of removing it.
pub struct UpdateArgs {
    pub key: String,
    pub reason: RemovedReason,
    pub updated_value: Option<Value>,
    pub updated_policy: Option<CachePolicy>,
}

/// Fired when an entry registered with `update_callback` expires or a
/// monitor attached to it changes, giving the caller a chance to refresh
/// the value before it disappears.
pub type UpdateCallback = Arc<dyn Fn(&mut UpdateArgs) + Send + Sync>;

/// Per-entry caching policy: expirations, priority, dependencies, callbacks.
#[derive(Default)]
pub struct CachePolicy {
    /// Wall-clock instant past which the entry expires. `None` means never.
    pub absolute_expiration: Option<SystemTime>,
    /// Inactivity window; every hit re-anchors the deadline to `now + window`.
    /// Zero disables sliding expiration.
    pub sliding_expiration: Duration,
    pub priority: Priority,
    /// Monitors the entry depends on; the entry is removed with
    /// [`RemovedReason::ChangeMonitorChanged`] when any of them fires.
    pub change_monitors: Vec<Arc<dyn ChangeMonitor>>,
    pub removed_callback: Option<RemovedCallback>,
    /// Mutually exclusive with `removed_callback`.
    pub update_callback: Option<UpdateCallback>,
}

impl CachePolicy {
    #[must_use]
    pub fn with_absolute_expiration(mut self, at: SystemTime) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    #[must_use]
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = window;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_change_monitor(mut self, monitor: Arc<dyn ChangeMonitor>) -> Self {
        self.change_monitors.push(monitor);
        self
    }

    #[must_use]
    pub fn with_removed_callback(mut self, cb: RemovedCallback) -> Self {
        self.removed_callback = Some(cb);
        self
    }

    #[must_use]
    pub fn with_update_callback(mut self, cb: UpdateCallback) -> Self {
        self.update_callback = Some(cb);
        self
    }

    /// Non-panicking validity check, used where a policy arrives from a
    /// callback rather than straight from the caller.
    pub(crate) fn is_valid(&self) -> bool {
        !(self.absolute_expiration.is_some() && !self.sliding_expiration.is_zero())
            && self.sliding_expiration <= MAX_SLIDING_EXPIRATION
            && !(self.removed_callback.is_some() && self.update_callback.is_some())
    }

    /// Panics on a contradictory policy. These are caller bugs, not runtime
    /// conditions.
    pub(crate) fn validate(&self) {
        if self.absolute_expiration.is_some() && !self.sliding_expiration.is_zero() {
            panic!("absolute and sliding expirations are mutually exclusive");
        }
        if self.sliding_expiration > MAX_SLIDING_EXPIRATION {
            panic!(
                "sliding expiration must be at most one year, got {:?}",
                self.sliding_expiration
            );
        }
        if self.removed_callback.is_some() && self.update_callback.is_some() {
            panic!("removed and update callbacks are mutually exclusive");
        }
    }
}
