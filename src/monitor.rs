use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::entry::CacheEntry;

/// A dependency an entry can be bound to. When the monitor reports a change
/// the cache removes every entry that listed it, with reason
/// [`ChangeMonitorChanged`](crate::RemovedReason::ChangeMonitorChanged).
///
/// Dropping a monitor is its disposal; implementations unregister from
/// whatever they watch in their `Drop`.
pub trait ChangeMonitor: Send + Sync {
    /// Stable identifier for the watched state.
    fn unique_id(&self) -> &str;

    fn has_changed(&self) -> bool;

    /// Registers the single change notification. May be called once per
    /// monitor; if the monitor has already changed the callback is invoked
    /// immediately on the calling thread.
    fn notify_on_changed(&self, on_changed: Box<dyn FnOnce() + Send>);
}

/// Shared one-shot state backing every monitor: changed flag plus the
/// at-most-one registered notification.
pub(crate) struct MonitorCore {
    state: Mutex<CoreState>,
}

#[derive(Default)]
struct CoreState {
    changed: bool,
    callback: Option<Box<dyn FnOnce() + Send>>,
    callback_registered: bool,
}

impl MonitorCore {
    pub(crate) fn new() -> Arc<MonitorCore> {
        Arc::new(MonitorCore {
            state: Mutex::new(CoreState::default()),
        })
    }

    pub(crate) fn has_changed(&self) -> bool {
        self.state.lock().changed
    }

    /// Marks the monitor changed and fires the registered notification.
    /// Later calls are no-ops, so the notification fires exactly once.
    pub(crate) fn on_changed(&self) {
        let callback = {
            let mut st = self.state.lock();
            if st.changed {
                return;
            }
            st.changed = true;
            st.callback.take()
        };
        if let Some(cb) = callback {
            cb();
        }
    }

    pub(crate) fn register(&self, on_changed: Box<dyn FnOnce() + Send>) {
        let mut st = self.state.lock();
        if st.callback_registered {
            panic!("notify_on_changed may only be called once per monitor");
        }
        st.callback_registered = true;
        if st.changed {
            drop(st);
            on_changed();
        } else {
            st.callback = Some(on_changed);
        }
    }
}

/// Watches a set of keys in the cache that created it. Reports a composite
/// id derived from each watched entry's key and creation ticks, the newest
/// creation instant as `last_modified`, and fires once when any watched
/// entry leaves the cache (or was already absent at construction).
pub struct CacheEntryChangeMonitor {
    core: Arc<MonitorCore>,
    unique_id: String,
    last_modified: SystemTime,
    keys: Vec<String>,
    watched: Vec<Arc<CacheEntry>>,
}

impl CacheEntryChangeMonitor {
    /// Built by [`MemoryCache::create_cache_entry_change_monitor`]
    /// (crate::MemoryCache::create_cache_entry_change_monitor); `resolved`
    /// pairs each requested key with the live entry found for it, if any.
    pub(crate) fn new(resolved: Vec<(String, Option<Arc<CacheEntry>>)>) -> CacheEntryChangeMonitor {
        let core = MonitorCore::new();
        let mut unique_id = String::new();
        let mut last_modified = UNIX_EPOCH;
        let mut keys = Vec::with_capacity(resolved.len());
        let mut watched = Vec::with_capacity(resolved.len());
        let mut changed = false;
        for (key, entry) in resolved {
            let created_ticks = match &entry {
                Some(entry) => {
                    if !entry.add_dependent(Arc::downgrade(&core)) {
                        changed = true;
                    }
                    watched.push(entry.clone());
                    entry.created()
                }
                None => {
                    // a missing entry counts as already changed
                    changed = true;
                    0
                }
            };
            unique_id.push_str(&key);
            unique_id.push_str(&format!("{created_ticks:X}"));
            let created = UNIX_EPOCH + Duration::from_millis(created_ticks);
            if created > last_modified {
                last_modified = created;
            }
            keys.push(key);
        }
        if changed {
            core.on_changed();
        }
        CacheEntryChangeMonitor {
            core,
            unique_id,
            last_modified,
            keys,
            watched,
        }
    }

    /// Newest creation instant among the watched entries.
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn cache_keys(&self) -> &[String] {
        &self.keys
    }
}

impl ChangeMonitor for CacheEntryChangeMonitor {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn has_changed(&self) -> bool {
        self.core.has_changed()
    }

    fn notify_on_changed(&self, on_changed: Box<dyn FnOnce() + Send>) {
        self.core.register(on_changed);
    }
}

impl Drop for CacheEntryChangeMonitor {
    fn drop(&mut self) {
        for entry in &self.watched {
            entry.remove_dependent(&self.core);
        }
    }
}

impl std::fmt::Debug for CacheEntryChangeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntryChangeMonitor")
            .field("unique_id", &self.unique_id)
            .field("changed", &self.has_changed())
            .finish()
    }
}
