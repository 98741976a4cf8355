use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{now_ticks, CacheEntry, EntryRef, Tick};
use crate::policy::RemovedReason;
use crate::store::pages::PageTable;
use crate::store::Shard;

/// Entries touched more recently than this are spared by the first
/// trimming pass.
pub(crate) const NEWADD_INTERVAL: Tick = 10_000;
/// Usage updates for the same entry are debounced to once per this window.
pub(crate) const CORRELATED_REQUEST_TIMEOUT: Tick = 1_000;
/// An expiring entry is only worth tracking if it will live at least this
/// long.
pub(crate) const MIN_LIFETIME_FOR_USAGE: Tick = NEWADD_INTERVAL;
/// Hard cap on evictions per underused flush.
const MAX_REMOVE: usize = 1024;

struct UsageSlot {
    entry: Arc<CacheEntry>,
    last_use: Tick,
    /// Neighbor toward the MRU head.
    prev: EntryRef,
    /// Neighbor toward the LRU tail.
    next: EntryRef,
}

struct UsageInner {
    table: PageTable<UsageSlot>,
    head: EntryRef,
    tail: EntryRef,
}

impl UsageInner {
    fn unlink(&mut self, r: EntryRef) {
        let (prev, next) = {
            let slot = self.table.get(r).expect("unlinking live slot");
            (slot.prev, slot.next)
        };
        if prev.is_invalid() {
            self.head = next;
        } else {
            self.table.get_mut(prev).expect("prev neighbor live").next = next;
        }
        if next.is_invalid() {
            self.tail = prev;
        } else {
            self.table.get_mut(next).expect("next neighbor live").prev = prev;
        }
    }

    fn splice_at_head(&mut self, r: EntryRef) {
        let old_head = self.head;
        {
            let slot = self.table.get_mut(r).expect("splicing live slot");
            slot.prev = EntryRef::INVALID;
            slot.next = old_head;
        }
        if !old_head.is_invalid() {
            self.table.get_mut(old_head).expect("head neighbor live").prev = r;
        }
        self.head = r;
        if self.tail.is_invalid() {
            self.tail = r;
        }
    }
}

/// Per-shard approximate-LRU ladder. A single bucket holds every trimmable
/// entry in a most-recently-used chain threaded through page slots; the
/// trimmer walks the tail and evicts the stalest first.
pub(crate) struct CacheUsage {
    inner: Mutex<UsageInner>,
    in_flush: AtomicBool,
}

impl CacheUsage {
    pub(crate) fn new() -> CacheUsage {
        CacheUsage {
            inner: Mutex::new(UsageInner {
                table: PageTable::new(),
                head: EntryRef::INVALID,
                tail: EntryRef::INVALID,
            }),
            in_flush: AtomicBool::new(false),
        }
    }

    pub(crate) fn add(&self, entry: &Arc<CacheEntry>) {
        let mut inner = self.inner.lock();
        let r = inner.table.alloc(UsageSlot {
            entry: entry.clone(),
            last_use: now_ticks(),
            prev: EntryRef::INVALID,
            next: EntryRef::INVALID,
        });
        inner.splice_at_head(r);
        entry.set_usage_ref(r);
    }

    /// Move to the MRU head. The per-entry debounce lives with the entry;
    /// this does the unconditional relink.
    pub(crate) fn update(&self, entry: &Arc<CacheEntry>) {
        let mut inner = self.inner.lock();
        let (_, r) = entry.usage_link();
        if r.is_invalid() {
            return;
        }
        match inner.table.get(r) {
            Some(slot) if Arc::ptr_eq(&slot.entry, entry) => {}
            _ => return,
        }
        inner.unlink(r);
        inner.splice_at_head(r);
        inner.table.get_mut(r).expect("slot verified above").last_use = now_ticks();
    }

    pub(crate) fn remove(&self, entry: &Arc<CacheEntry>) {
        let mut inner = self.inner.lock();
        let (_, r) = entry.usage_link();
        if r.is_invalid() {
            return;
        }
        match inner.table.get(r) {
            Some(slot) if Arc::ptr_eq(&slot.entry, entry) => {}
            _ => return,
        }
        inner.unlink(r);
        inner.table.free(r);
        entry.set_usage_ref(EntryRef::INVALID);
    }

    /// Evict up to `target` of the least-recently-used entries, sparing
    /// fresh arrivals on the first pass, then forcing if the target was not
    /// met. Capped at 1024; a flush arriving while one runs is swallowed.
    pub(crate) fn flush_under_used(&self, shard: &Shard, target: usize) -> usize {
        if target == 0 {
            return 0;
        }
        if self.in_flush.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let max = target.min(MAX_REMOVE);
        let mut victims = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = now_ticks();
            for force in [false, true] {
                if victims.len() >= max {
                    break;
                }
                let mut cur = inner.tail;
                while !cur.is_invalid() && victims.len() < max {
                    let (toward_head, seasoned, entry) = {
                        let slot = inner.table.get(cur).expect("tail chain live");
                        (
                            slot.prev,
                            now.saturating_sub(slot.last_use) >= NEWADD_INTERVAL,
                            slot.entry.clone(),
                        )
                    };
                    if force || seasoned {
                        inner.unlink(cur);
                        inner.table.free(cur);
                        entry.set_usage_ref(EntryRef::INVALID);
                        victims.push(entry);
                    }
                    cur = toward_head;
                }
            }
        }
        for entry in &victims {
            shard.remove_entry(entry, RemovedReason::Evicted);
        }
        self.in_flush.store(false, Ordering::SeqCst);
        if !victims.is_empty() {
            tracing::trace!(evicted = victims.len(), "underused entries flushed");
        }
        victims.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Rewrites an entry's last-use stamp so tests can season entries
    /// without sleeping through `NEWADD_INTERVAL`.
    #[cfg(test)]
    pub(crate) fn backdate(&self, entry: &Arc<CacheEntry>, last_use: Tick) {
        let mut inner = self.inner.lock();
        let (_, r) = entry.usage_link();
        if let Some(slot) = inner.table.get_mut(r) {
            slot.last_use = last_use;
        }
    }

    #[cfg(test)]
    fn tail_keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys = Vec::new();
        let mut cur = inner.tail;
        while !cur.is_invalid() {
            let slot = inner.table.get(cur).unwrap();
            keys.push(slot.entry.key().to_string());
            cur = slot.prev;
        }
        keys
    }
}
