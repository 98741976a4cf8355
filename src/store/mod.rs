use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::entry::{duration_ticks, now_ticks, CacheEntry, EntryState};
use crate::monitor::ChangeMonitor;
use crate::policy::RemovedReason;

pub(crate) mod expires;
mod pages;
pub(crate) mod usage;

use expires::{CacheExpires, MIN_UPDATE_DELTA};
use usage::{CacheUsage, CORRELATED_REQUEST_TIMEOUT, MIN_LIFETIME_FOR_USAGE};

/// Longest an insert waits for a flushing wheel before proceeding anyway.
const INSERT_BLOCK_WAIT: Duration = Duration::from_secs(10);

/// Manual-reset gate that briefly pauses admissions while the wheel splices
/// a large expired batch out of the shard.
struct InsertGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl InsertGate {
    fn new() -> InsertGate {
        InsertGate {
            open: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the gate opens or the timeout passes; a timed-out wait
    /// proceeds anyway, at worst racing one flush.
    fn wait(&self, timeout: Duration) {
        let mut open = self.open.lock();
        if !*open {
            self.cond.wait_while_for(&mut open, |open| !*open, timeout);
        }
    }

    fn block(&self) {
        *self.open.lock() = false;
    }

    fn unblock(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_all();
    }
}

/// The concurrency unit of the cache: one mutex-guarded key map plus its
/// expiration wheel and usage ladder. Map mutations happen under the lock;
/// wheel/ladder registration and entry release always happen outside it.
pub(crate) struct Shard {
    entries: Mutex<HashMap<Arc<str>, Arc<CacheEntry>>>,
    expires: CacheExpires,
    usage: CacheUsage,
    gate: InsertGate,
    use_insert_block: bool,
    disposed: AtomicBool,
}

impl Shard {
    pub(crate) fn new(use_insert_block: bool) -> Arc<Shard> {
        Arc::new(Shard {
            entries: Mutex::new(HashMap::new()),
            expires: CacheExpires::new(),
            usage: CacheUsage::new(),
            gate: InsertGate::new(),
            use_insert_block,
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Read-only observer: present and not past its deadline.
    pub(crate) fn contains(&self, key: &str) -> bool {
        let map = self.entries.lock();
        map.get(key).is_some_and(|e| !e.is_expired(now_ticks()))
    }

    /// Inserts `entry` unless a live one is present, in which case the
    /// existing entry is touched and returned and the new one is never
    /// admitted. An expired incumbent is replaced and released with
    /// `Expired` only after the newcomer is fully linked.
    pub(crate) fn add_or_get_existing(
        self: &Arc<Shard>,
        entry: Arc<CacheEntry>,
    ) -> Option<Arc<CacheEntry>> {
        if self.use_insert_block && entry.has_usage() {
            self.gate.wait(INSERT_BLOCK_WAIT);
        }
        let mut existing = None;
        let mut stale = None;
        let mut added = false;
        {
            let mut map = self.entries.lock();
            if !self.disposed.load(Ordering::SeqCst) {
                if let Some(cur) = map.get(entry.key()).cloned() {
                    if cur.is_expired(now_ticks()) {
                        cur.set_state(EntryState::RemovingFromCache);
                        stale = Some(cur);
                    } else {
                        existing = Some(cur);
                    }
                }
                if existing.is_none() {
                    entry.set_state(EntryState::AddingToCache);
                    map.insert(entry.key_arc(), entry.clone());
                    added = true;
                }
            }
        }
        if let Some(stale) = &stale {
            self.remove_from_cache(stale, RemovedReason::Expired, true, false);
        }
        if added {
            self.add_to_cache(&entry);
        } else if existing.is_none() {
            // closed shard: the entry was never admitted; releasing it here
            // fires its removal callback and drops any policy-owned monitors
            // so nothing leaks
            entry.release(RemovedReason::CacheSpecificEviction, false);
        }
        if let Some(existing) = &existing {
            self.update_exp_and_usage(existing);
        }
        // released only now so a removal callback can re-take a dependency
        // on the freshly inserted entry
        if let Some(stale) = stale {
            stale.release(RemovedReason::Expired, false);
        }
        existing
    }

    /// Unconditional replace. The displaced entry, if any, is released with
    /// `Removed`, or `Expired` when it was already past its deadline.
    pub(crate) fn set(self: &Arc<Shard>, entry: Arc<CacheEntry>) {
        if self.use_insert_block && entry.has_usage() {
            self.gate.wait(INSERT_BLOCK_WAIT);
        }
        let mut existing = None;
        let mut added = false;
        {
            let mut map = self.entries.lock();
            if !self.disposed.load(Ordering::SeqCst) {
                if let Some(cur) = map.get(entry.key()).cloned() {
                    cur.set_state(EntryState::RemovingFromCache);
                    existing = Some(cur);
                }
                entry.set_state(EntryState::AddingToCache);
                map.insert(entry.key_arc(), entry.clone());
                added = true;
            }
        }
        let mut reason = RemovedReason::Removed;
        if let Some(cur) = &existing {
            if cur.is_expired(now_ticks()) {
                reason = RemovedReason::Expired;
            }
            self.remove_from_cache(cur, reason, true, false);
        }
        if added {
            self.add_to_cache(&entry);
        } else {
            // closed cache: the entry was never admitted; releasing it here
            // drops any policy-owned monitors so nothing leaks
            entry.release(RemovedReason::CacheSpecificEviction, false);
        }
        if let Some(cur) = existing {
            cur.release(reason, false);
        }
    }

    /// Looks the key up, lazily removing it when expired. `touch` slides
    /// the expiration and records usage.
    pub(crate) fn get(&self, key: &str, touch: bool) -> Option<Arc<CacheEntry>> {
        let (entry, expired) = {
            let map = self.entries.lock();
            match map.get(key) {
                Some(e) => (Some(e.clone()), e.is_expired(now_ticks())),
                None => (None, false),
            }
        };
        let entry = entry?;
        if expired {
            self.remove(key, Some(&entry), RemovedReason::Expired);
            return None;
        }
        if touch {
            self.update_exp_and_usage(&entry);
        }
        Some(entry)
    }

    /// Atomic removal; `expected` guards against deleting a newer entry
    /// that reused the key.
    pub(crate) fn remove(
        &self,
        key: &str,
        expected: Option<&Arc<CacheEntry>>,
        reason: RemovedReason,
    ) -> Option<Arc<CacheEntry>> {
        let entry = {
            let mut map = self.entries.lock();
            if self.disposed.load(Ordering::SeqCst) {
                None
            } else {
                let cur = map
                    .get(key)
                    .filter(|cur| expected.is_none_or(|e| Arc::ptr_eq(cur, e)))
                    .cloned();
                if let Some(cur) = &cur {
                    cur.set_state(EntryState::RemovingFromCache);
                    map.remove(key);
                }
                cur
            }
        };
        if let Some(entry) = &entry {
            self.remove_from_cache(entry, reason, false, false);
        }
        entry
    }

    /// Identity-checked removal used by the wheel and the ladder.
    pub(crate) fn remove_entry(&self, entry: &Arc<CacheEntry>, reason: RemovedReason) {
        self.remove(entry.key(), Some(entry), reason);
    }

    /// Flush the expiration wheel. Rate-limited inside the wheel when
    /// `check_delta` is set.
    pub(crate) fn flush_expired(&self, check_delta: bool) -> usize {
        self.expires.flush_expired(self, check_delta)
    }

    /// Flush expired entries, then evict underused ones until `percent` of
    /// the shard is gone. Returns how many entries left the shard.
    pub(crate) fn trim(&self, percent: usize) -> usize {
        if percent == 0 || self.disposed.load(Ordering::SeqCst) {
            return 0;
        }
        let count = self.count();
        let to_trim = (count * percent).div_ceil(100);
        if to_trim == 0 {
            return 0;
        }
        let expired = self.expires.flush_expired(self, true);
        let mut evicted = 0;
        if expired < to_trim {
            evicted = self.usage.flush_under_used(self, to_trim - expired);
        }
        expired + evicted
    }

    /// Registration half of an insert, run outside the map lock: link into
    /// the wheel and ladder, then publish with the Adding→Added CAS. Losing
    /// that CAS means a remover got there first; the loser unwinds its own
    /// registrations.
    fn add_to_cache(self: &Arc<Shard>, entry: &Arc<CacheEntry>) {
        let now = now_ticks();
        if entry.has_expiration() {
            self.expires.add(entry);
        }
        if entry.has_usage()
            && (!entry.has_expiration()
                || entry.expires().saturating_sub(now) >= MIN_LIFETIME_FOR_USAGE)
        {
            self.usage.add(entry);
        }
        if !entry.cas_state(EntryState::AddedToCache, EntryState::AddingToCache) {
            if entry.in_expires() {
                self.expires.remove(entry);
            }
            if entry.in_usage() {
                self.usage.remove(entry);
            }
        }
        self.register_dependencies(entry);
    }

    /// Arms each policy change monitor to remove this entry when it fires.
    /// A monitor that already changed fires on the spot.
    fn register_dependencies(self: &Arc<Shard>, entry: &Arc<CacheEntry>) {
        let dependencies: Vec<Arc<dyn ChangeMonitor>> = entry.aux().lock().dependencies.clone();
        for monitor in dependencies {
            let shard = Arc::downgrade(self);
            let target = Arc::downgrade(entry);
            monitor.notify_on_changed(Box::new(move || {
                if let (Some(shard), Some(entry)) = (shard.upgrade(), target.upgrade()) {
                    if entry.state() == EntryState::AddedToCache {
                        shard.remove(entry.key(), Some(&entry), RemovedReason::ChangeMonitorChanged);
                    }
                }
            }));
        }
    }

    fn remove_from_cache(
        &self,
        entry: &Arc<CacheEntry>,
        reason: RemovedReason,
        delay_release: bool,
        suppress_callback: bool,
    ) {
        if entry.in_expires() {
            self.expires.remove(entry);
        }
        if entry.in_usage() {
            self.usage.remove(entry);
        }
        entry.set_state(EntryState::RemovedFromCache);
        if !delay_release {
            entry.release(reason, suppress_callback);
        }
    }

    /// Touch an entry on a hit: debounced usage update, hysteresis-guarded
    /// sliding re-anchor, and the same treatment for its update sentinel.
    pub(crate) fn update_exp_and_usage(&self, entry: &Arc<CacheEntry>) {
        let now = now_ticks();
        if entry.in_usage()
            && now.saturating_sub(entry.last_usage_update()) >= CORRELATED_REQUEST_TIMEOUT
        {
            entry.set_last_usage_update(now);
            self.usage.update(entry);
        }
        if !entry.sliding().is_zero() {
            let new_expires = now.saturating_add(duration_ticks(entry.sliding()));
            let current = entry.expires();
            if new_expires.saturating_sub(current) >= MIN_UPDATE_DELTA || new_expires < current {
                self.expires.update(entry, new_expires);
            }
        }
        let sentinel = entry.aux().lock().update_sentinel.clone();
        if let Some((shard, weak)) = sentinel {
            if let Some(sentinel) = weak.upgrade() {
                shard.update_exp_and_usage(&sentinel);
            }
        }
    }

    pub(crate) fn block_insert(&self) {
        if self.use_insert_block {
            self.gate.block();
        }
    }

    pub(crate) fn unblock_insert(&self) {
        if self.use_insert_block {
            self.gate.unblock();
        }
    }

    /// Drains the shard on cache teardown. Removal callbacks are suppressed
    /// unless teardown callbacks were enabled, in which case they fire with
    /// `Disposing`.
    pub(crate) fn dispose(&self, callbacks_on_close: bool) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Arc<CacheEntry>> = {
            let mut map = self.entries.lock();
            map.drain()
                .map(|(_, entry)| {
                    entry.set_state(EntryState::RemovingFromCache);
                    entry
                })
                .collect()
        };
        let (reason, suppress) = if callbacks_on_close {
            (RemovedReason::Disposing, false)
        } else {
            (RemovedReason::CacheSpecificEviction, true)
        };
        for entry in drained {
            self.remove_from_cache(&entry, reason, false, suppress);
        }
        // anyone parked on the gate is let through; the wheel is done here
        self.gate.unblock();
    }

    #[cfg(test)]
    pub(crate) fn usage_for_test(&self) -> &CacheUsage {
        &self.usage
    }

    #[cfg(test)]
    pub(crate) fn expires_for_test(&self) -> &CacheExpires {
        &self.expires
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{now_ticks, Tick, NEVER};
    use crate::policy::{Priority, RemovedArgs, RemovedReason};
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    fn entry_with(
        key: &str,
        expires_in: Option<Duration>,
        priority: Priority,
        on_removed: Option<Arc<dyn Fn(RemovedArgs) + Send + Sync>>,
    ) -> Arc<CacheEntry> {
        CacheEntry::new(
            Arc::from(key),
            Arc::new(key.to_string()),
            now_ticks(),
            expires_in.map(|d| SystemTime::now() + d),
            Duration::ZERO,
            priority,
            on_removed,
            Vec::new(),
        )
    }

    fn plain(key: &str) -> Arc<CacheEntry> {
        entry_with(key, None, Priority::Default, None)
    }

    fn counting(key: &str, reason: RemovedReason, hits: &Arc<AtomicUsize>) -> Arc<CacheEntry> {
        let hits = hits.clone();
        entry_with(
            key,
            None,
            Priority::Default,
            Some(Arc::new(move |args: RemovedArgs| {
                assert_eq!(args.reason, reason);
                hits.fetch_add(1, Ordering::SeqCst);
            })),
        )
    }

    #[test]
    fn add_then_get() {
        let shard = Shard::new(false);
        assert!(shard.add_or_get_existing(plain("k")).is_none());
        let got = shard.get("k", true).unwrap();
        assert_eq!(got.state(), EntryState::AddedToCache);
        assert_eq!(shard.count(), 1);
        assert!(shard.contains("k"));
    }

    #[test]
    fn add_or_get_returns_incumbent() {
        let shard = Shard::new(false);
        assert!(shard.add_or_get_existing(plain("k")).is_none());
        let loser = plain("k");
        let existing = shard.add_or_get_existing(loser.clone()).unwrap();
        assert_eq!(existing.state(), EntryState::AddedToCache);
        // the loser was never admitted
        assert_eq!(loser.state(), EntryState::NotInCache);
        assert_eq!(shard.count(), 1);
    }

    #[test]
    fn add_or_get_replaces_expired_incumbent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        let stale = {
            let hits = hits.clone();
            entry_with(
                "k",
                Some(Duration::ZERO),
                Priority::Default,
                Some(Arc::new(move |args: RemovedArgs| {
                    assert_eq!(args.reason, RemovedReason::Expired);
                    hits.fetch_add(1, Ordering::SeqCst);
                })),
            )
        };
        assert!(shard.add_or_get_existing(stale.clone()).is_none());
        std::thread::sleep(Duration::from_millis(5));
        assert!(shard.add_or_get_existing(plain("k")).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(stale.state(), EntryState::Closed);
        assert_eq!(shard.count(), 1);
    }

    #[test]
    fn set_displaces_with_removed_reason() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        shard.set(counting("k", RemovedReason::Removed, &hits));
        shard.set(plain("k"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(shard.count(), 1);
    }

    #[test]
    fn remove_returns_entry_and_fires_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        shard.set(counting("k", RemovedReason::Removed, &hits));
        let removed = shard.remove("k", None, RemovedReason::Removed).unwrap();
        assert_eq!(removed.state(), EntryState::Closed);
        assert!(!removed.in_expires());
        assert!(!removed.in_usage());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(shard.count(), 0);
        assert!(shard.remove("k", None, RemovedReason::Removed).is_none());
    }

    #[test]
    fn expired_entry_is_lazily_removed_on_get() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        let e = {
            let hits = hits.clone();
            entry_with(
                "k",
                Some(Duration::from_millis(30)),
                Priority::Default,
                Some(Arc::new(move |args: RemovedArgs| {
                    assert_eq!(args.reason, RemovedReason::Expired);
                    hits.fetch_add(1, Ordering::SeqCst);
                })),
            )
        };
        assert!(shard.add_or_get_existing(e).is_none());
        assert!(shard.get("k", true).is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert!(shard.get("k", true).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!shard.contains("k"));
    }

    #[test]
    fn wheel_flush_collects_due_entries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        for i in 0..5 {
            let hits = hits.clone();
            let e = entry_with(
                &format!("k{i}"),
                Some(Duration::from_millis(20)),
                Priority::Default,
                Some(Arc::new(move |args: RemovedArgs| {
                    assert_eq!(args.reason, RemovedReason::Expired);
                    hits.fetch_add(1, Ordering::SeqCst);
                })),
            );
            assert!(shard.add_or_get_existing(e).is_none());
        }
        shard.set(plain("stays"));
        assert_eq!(shard.expires_for_test().len(), 5);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(shard.flush_expired(false), 5);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(shard.count(), 1);
        assert_eq!(shard.expires_for_test().len(), 0);
        assert!(shard.contains("stays"));
    }

    #[test]
    fn flush_rate_limit_swallows_back_to_back_calls() {
        let shard = Shard::new(false);
        let e = entry_with("k", Some(Duration::ZERO), Priority::Default, None);
        assert!(shard.add_or_get_existing(e).is_none());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(shard.flush_expired(true), 1);
        shard.set(entry_with("k2", Some(Duration::ZERO), Priority::Default, None));
        std::thread::sleep(Duration::from_millis(5));
        // second delta-checked flush inside a second is a no-op
        assert_eq!(shard.flush_expired(true), 0);
        assert_eq!(shard.flush_expired(false), 1);
    }

    #[test]
    fn short_lived_entries_skip_the_ladder() {
        let shard = Shard::new(false);
        let short = entry_with("short", Some(Duration::from_secs(2)), Priority::Default, None);
        let long = entry_with("long", Some(Duration::from_secs(60)), Priority::Default, None);
        let pinned = entry_with("pinned", None, Priority::NotRemovable, None);
        assert!(shard.add_or_get_existing(short.clone()).is_none());
        assert!(shard.add_or_get_existing(long.clone()).is_none());
        assert!(shard.add_or_get_existing(pinned.clone()).is_none());
        assert!(!short.in_usage());
        assert!(long.in_usage());
        assert!(!pinned.in_usage());
        assert!(pinned.in_expires() || !pinned.has_expiration());
    }

    #[test]
    fn trim_evicts_lru_first_and_spares_not_removable() {
        let shard = Shard::new(false);
        for i in 0..20 {
            shard.set(plain(&format!("k{i}")));
        }
        shard.set(entry_with("pinned", None, Priority::NotRemovable, None));
        // season the first ten so the gentle pass can take them
        let old = now_ticks() - usage::NEWADD_INTERVAL - 1;
        for i in 0..10 {
            let e = shard.get(&format!("k{i}"), false).unwrap();
            shard.usage_for_test().backdate(&e, old as Tick);
        }
        let trimmed = shard.trim(50);
        assert!(trimmed >= 10, "trimmed {trimmed}");
        assert!(shard.contains("pinned"));
        assert_eq!(shard.count(), 21 - trimmed);
        // the seasoned set went first
        for i in 0..10 {
            assert!(!shard.contains(&format!("k{i}")));
        }
    }

    #[test]
    fn trim_zero_is_a_no_op() {
        let shard = Shard::new(false);
        shard.set(plain("k"));
        assert_eq!(shard.trim(0), 0);
        assert_eq!(shard.count(), 1);
    }

    #[test]
    fn dispose_suppresses_callbacks_by_default() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        shard.set(counting("k", RemovedReason::Removed, &hits));
        shard.dispose(false);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(shard.count(), 0);
        // operations on a disposed shard are no-ops
        assert!(shard.add_or_get_existing(plain("x")).is_none());
        assert_eq!(shard.count(), 0);
        assert!(shard.get("x", true).is_none());
        // a never-admitted entry is still released so its callback fires
        // and its policy-owned monitors are dropped
        let late_hits = Arc::new(AtomicUsize::new(0));
        let late = counting("y", RemovedReason::CacheSpecificEviction, &late_hits);
        assert!(shard.add_or_get_existing(late.clone()).is_none());
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
        assert_eq!(late.state(), EntryState::Closed);
    }

    #[test]
    fn dispose_with_callbacks_uses_disposing_reason() {
        let hits = Arc::new(AtomicUsize::new(0));
        let shard = Shard::new(false);
        shard.set(counting("k", RemovedReason::Disposing, &hits));
        shard.dispose(true);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sliding_expiration_advances_on_get() {
        let shard = Shard::new(false);
        let e = CacheEntry::new(
            Arc::from("k"),
            Arc::new(()),
            now_ticks(),
            None,
            Duration::from_secs(3),
            Priority::Default,
            None,
            Vec::new(),
        );
        assert!(shard.add_or_get_existing(e.clone()).is_none());
        let first_deadline = e.expires();
        assert_ne!(first_deadline, NEVER);
        // a hit within the hysteresis window leaves the deadline alone
        shard.get("k", true);
        assert_eq!(e.expires(), first_deadline);
        std::thread::sleep(Duration::from_millis(1_100));
        shard.get("k", true);
        assert!(e.expires() > first_deadline);
    }

    #[test]
    fn insert_gate_times_out_and_proceeds() {
        let gate = InsertGate::new();
        gate.block();
        let started = std::time::Instant::now();
        gate.wait(Duration::from_millis(50));
        assert!(started.elapsed() >= Duration::from_millis(50));
        gate.unblock();
        let started = std::time::Instant::now();
        gate.wait(Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
