use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::monitor::{ChangeMonitor, MonitorCore};
use crate::policy::{Priority, RemovedArgs, RemovedCallback, RemovedReason};
use crate::store::Shard;
use crate::Value;

/// Milliseconds since `UNIX_EPOCH`. All internal deadlines use this unit so
/// they fit in an `AtomicU64` and sliding updates need no entry lock.
pub(crate) type Tick = u64;

/// Absolute-expiry sentinel for "never expires".
pub(crate) const NEVER: Tick = u64::MAX;

/// Bucket byte marking "not linked into this structure".
pub(crate) const NO_BUCKET: u8 = 0xff;

pub(crate) fn now_ticks() -> Tick {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn system_time_to_ticks(t: SystemTime) -> Tick {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn duration_ticks(d: Duration) -> Tick {
    d.as_millis() as u64
}

/// Packed handle into a page table: page index in the high 24 bits, slot
/// index (1..=127) in the low 8. Zero is the invalid sentinel; slot 0 of
/// every page is reserved so a live handle can never be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryRef(u32);

impl EntryRef {
    pub(crate) const INVALID: EntryRef = EntryRef(0);

    pub(crate) fn new(page: u32, slot: u8) -> Self {
        debug_assert!(page < (1 << 24));
        debug_assert!(slot != 0);
        EntryRef((page << 8) | slot as u32)
    }

    pub(crate) fn page(self) -> u32 {
        self.0 >> 8
    }

    pub(crate) fn slot(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub(crate) fn is_invalid(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        EntryRef(raw)
    }
}

/// Lifecycle stage of an entry. Advanced only by compare-and-swap so every
/// transition has exactly one winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntryState {
    NotInCache = 0,
    AddingToCache = 1,
    AddedToCache = 2,
    RemovingFromCache = 3,
    RemovedFromCache = 4,
    Closed = 5,
}

impl EntryState {
    fn from_u8(v: u8) -> EntryState {
        match v {
            0 => EntryState::NotInCache,
            1 => EntryState::AddingToCache,
            2 => EntryState::AddedToCache,
            3 => EntryState::RemovingFromCache,
            4 => EntryState::RemovedFromCache,
            _ => EntryState::Closed,
        }
    }
}

/// Fields most entries never touch, split off behind a mutex so the hot
/// read paths stay lock-free.
#[derive(Default)]
pub(crate) struct EntryAux {
    /// Monitors this entry depends on; dropping them is their disposal.
    pub(crate) dependencies: Vec<Arc<dyn ChangeMonitor>>,
    /// Monitors watching this entry, notified on release. Weak so the
    /// monitor→entry→monitor cycle has no owning back-edge.
    pub(crate) dependents: Vec<Weak<MonitorCore>>,
    /// Sentinel companion for the update-callback feature: touching this
    /// entry also slides the sentinel's expiration.
    pub(crate) update_sentinel: Option<(Arc<Shard>, Weak<CacheEntry>)>,
}

/// One cached item: key, value handle, deadlines, state, and the back-links
/// that let the expiration wheel and usage ladder find their slots again.
pub(crate) struct CacheEntry {
    key: Arc<str>,
    value: Value,
    created: Tick,
    sliding: Duration,
    priority: Priority,
    state: AtomicU8,
    expires: AtomicU64,
    expires_bucket: AtomicU8,
    expires_ref: AtomicU32,
    usage_bucket: AtomicU8,
    usage_ref: AtomicU32,
    last_usage_update: AtomicU64,
    removed_callback: Option<RemovedCallback>,
    aux: Mutex<EntryAux>,
}

impl CacheEntry {
    pub(crate) fn new(
        key: Arc<str>,
        value: Value,
        created: Tick,
        absolute: Option<SystemTime>,
        sliding: Duration,
        priority: Priority,
        removed_callback: Option<RemovedCallback>,
        dependencies: Vec<Arc<dyn ChangeMonitor>>,
    ) -> Arc<CacheEntry> {
        let expires = if !sliding.is_zero() {
            created.saturating_add(duration_ticks(sliding))
        } else {
            absolute.map(system_time_to_ticks).unwrap_or(NEVER)
        };
        let usage_bucket = match priority {
            Priority::Default => 0,
            Priority::NotRemovable => NO_BUCKET,
        };
        Arc::new(CacheEntry {
            key,
            value,
            created,
            sliding,
            priority,
            state: AtomicU8::new(EntryState::NotInCache as u8),
            expires: AtomicU64::new(expires),
            expires_bucket: AtomicU8::new(NO_BUCKET),
            expires_ref: AtomicU32::new(EntryRef::INVALID.raw()),
            usage_bucket: AtomicU8::new(usage_bucket),
            usage_ref: AtomicU32::new(EntryRef::INVALID.raw()),
            last_usage_update: AtomicU64::new(created),
            removed_callback,
            aux: Mutex::new(EntryAux {
                dependencies,
                ..EntryAux::default()
            }),
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn key_arc(&self) -> Arc<str> {
        self.key.clone()
    }

    pub(crate) fn value(&self) -> Value {
        self.value.clone()
    }

    pub(crate) fn created(&self) -> Tick {
        self.created
    }

    pub(crate) fn sliding(&self) -> Duration {
        self.sliding
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Single-winner transition; the loser must undo its side effects.
    pub(crate) fn cas_state(&self, new: EntryState, expected: EntryState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn expires(&self) -> Tick {
        self.expires.load(Ordering::SeqCst)
    }

    pub(crate) fn set_expires(&self, at: Tick) {
        self.expires.store(at, Ordering::SeqCst);
    }

    pub(crate) fn is_expired(&self, now: Tick) -> bool {
        self.expires() <= now
    }

    pub(crate) fn has_expiration(&self) -> bool {
        self.expires() != NEVER
    }

    /// Trimmable entries participate in the usage ladder.
    pub(crate) fn has_usage(&self) -> bool {
        self.priority != Priority::NotRemovable
    }

    pub(crate) fn expires_link(&self) -> (u8, EntryRef) {
        (
            self.expires_bucket.load(Ordering::SeqCst),
            EntryRef::from_raw(self.expires_ref.load(Ordering::SeqCst)),
        )
    }

    pub(crate) fn set_expires_link(&self, bucket: u8, r: EntryRef) {
        self.expires_bucket.store(bucket, Ordering::SeqCst);
        self.expires_ref.store(r.raw(), Ordering::SeqCst);
    }

    pub(crate) fn set_expires_ref(&self, r: EntryRef) {
        self.expires_ref.store(r.raw(), Ordering::SeqCst);
    }

    pub(crate) fn in_expires(&self) -> bool {
        !EntryRef::from_raw(self.expires_ref.load(Ordering::SeqCst)).is_invalid()
    }

    pub(crate) fn usage_link(&self) -> (u8, EntryRef) {
        (
            self.usage_bucket.load(Ordering::SeqCst),
            EntryRef::from_raw(self.usage_ref.load(Ordering::SeqCst)),
        )
    }

    pub(crate) fn set_usage_ref(&self, r: EntryRef) {
        self.usage_ref.store(r.raw(), Ordering::SeqCst);
    }

    pub(crate) fn in_usage(&self) -> bool {
        !EntryRef::from_raw(self.usage_ref.load(Ordering::SeqCst)).is_invalid()
    }

    pub(crate) fn last_usage_update(&self) -> Tick {
        self.last_usage_update.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_usage_update(&self, at: Tick) {
        self.last_usage_update.store(at, Ordering::SeqCst);
    }

    pub(crate) fn aux(&self) -> &Mutex<EntryAux> {
        &self.aux
    }

    /// Records a monitor watching this entry. Fails when the entry is
    /// already on its way out, in which case the monitor must treat the
    /// dependency as changed.
    pub(crate) fn add_dependent(&self, dependent: Weak<MonitorCore>) -> bool {
        let mut aux = self.aux.lock();
        if self.state() > EntryState::AddedToCache {
            return false;
        }
        aux.dependents.push(dependent);
        true
    }

    pub(crate) fn remove_dependent(&self, dependent: &Arc<MonitorCore>) {
        let target = Arc::downgrade(dependent);
        let mut aux = self.aux.lock();
        aux.dependents.retain(|w| !Weak::ptr_eq(w, &target));
    }

    pub(crate) fn configure_update_sentinel(&self, shard: Arc<Shard>, sentinel: Weak<CacheEntry>) {
        self.aux.lock().update_sentinel = Some((shard, sentinel));
    }

    /// Final release: notify dependents, fire the removal callback at most
    /// once, drop owned monitors. Called outside every lock by whichever
    /// actor completed the removal.
    pub(crate) fn release(&self, reason: RemovedReason, suppress_callback: bool) {
        if self.state.swap(EntryState::Closed as u8, Ordering::SeqCst) == EntryState::Closed as u8 {
            return;
        }
        let (dependents, dependencies, _sentinel) = {
            let mut aux = self.aux.lock();
            (
                std::mem::take(&mut aux.dependents),
                std::mem::take(&mut aux.dependencies),
                aux.update_sentinel.take(),
            )
        };
        for dependent in dependents {
            if let Some(core) = dependent.upgrade() {
                core.on_changed();
            }
        }
        if !suppress_callback {
            if let Some(cb) = &self.removed_callback {
                let args = RemovedArgs {
                    key: self.key.to_string(),
                    value: self.value.clone(),
                    reason,
                };
                if catch_unwind(AssertUnwindSafe(|| cb(args))).is_err() {
                    tracing::warn!(key = %self.key, ?reason, "removal callback panicked");
                }
            }
        }
        drop(dependencies);
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("expires", &self.expires())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn entry(key: &str) -> Arc<CacheEntry> {
        CacheEntry::new(
            Arc::from(key),
            Arc::new(1u32),
            now_ticks(),
            None,
            Duration::ZERO,
            Priority::Default,
            None,
            Vec::new(),
        )
    }

    #[test]
    fn entry_ref_packing() {
        let r = EntryRef::new(0x00ab_cdef, 42);
        assert_eq!(r.page(), 0x00ab_cdef);
        assert_eq!(r.slot(), 42);
        assert!(!r.is_invalid());
        assert!(EntryRef::INVALID.is_invalid());
        assert_eq!(EntryRef::from_raw(r.raw()), r);
    }

    #[test]
    fn state_cas_single_winner() {
        let e = entry("k");
        e.set_state(EntryState::AddingToCache);
        assert!(e.cas_state(EntryState::AddedToCache, EntryState::AddingToCache));
        assert!(!e.cas_state(EntryState::AddedToCache, EntryState::AddingToCache));
        assert_eq!(e.state(), EntryState::AddedToCache);
    }

    #[test]
    fn sliding_expiry_anchors_to_creation() {
        let created = now_ticks();
        let e = CacheEntry::new(
            Arc::from("k"),
            Arc::new(()),
            created,
            Some(SystemTime::now()),
            Duration::from_secs(5),
            Priority::Default,
            None,
            Vec::new(),
        );
        // sliding takes precedence over any absolute instant
        assert_eq!(e.expires(), created + 5_000);
    }

    #[test]
    fn not_removable_has_no_usage() {
        let e = CacheEntry::new(
            Arc::from("k"),
            Arc::new(()),
            now_ticks(),
            None,
            Duration::ZERO,
            Priority::NotRemovable,
            None,
            Vec::new(),
        );
        assert!(!e.has_usage());
        assert!(!e.in_usage());
    }

    #[test]
    fn release_fires_callback_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let e = CacheEntry::new(
            Arc::from("k"),
            Arc::new(7u32),
            now_ticks(),
            None,
            Duration::ZERO,
            Priority::Default,
            Some(Arc::new(move |args: RemovedArgs| {
                assert_eq!(args.key, "k");
                assert_eq!(args.reason, RemovedReason::Removed);
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
            Vec::new(),
        );
        e.set_state(EntryState::RemovedFromCache);
        e.release(RemovedReason::Removed, false);
        e.release(RemovedReason::Removed, false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(e.state(), EntryState::Closed);
    }

    #[test]
    fn release_can_suppress_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let e = CacheEntry::new(
            Arc::from("k"),
            Arc::new(()),
            now_ticks(),
            None,
            Duration::ZERO,
            Priority::Default,
            Some(Arc::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
            Vec::new(),
        );
        e.release(RemovedReason::Disposing, true);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
