use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{now_ticks, CacheEntry, EntryRef, Tick, NEVER, NO_BUCKET};
use crate::policy::RemovedReason;
use crate::store::pages::PageTable;
use crate::store::Shard;

pub(crate) const NUM_BUCKETS: usize = 30;
/// Wall-clock slice covered by one bucket.
pub(crate) const TICKS_PER_BUCKET: Tick = 20_000;
const TICKS_PER_CYCLE: Tick = NUM_BUCKETS as Tick * TICKS_PER_BUCKET;

/// Sliding-expiration updates smaller than this are skipped.
pub(crate) const MIN_UPDATE_DELTA: Tick = 1_000;
/// A wheel flushes at most once per this interval.
pub(crate) const MIN_FLUSH_INTERVAL: Tick = 1_000;

const COUNTS_LENGTH: usize = 4;
const COUNT_INTERVAL: Tick = TICKS_PER_BUCKET / COUNTS_LENGTH as Tick;

/// Bucket an absolute deadline lands in.
fn bucket_for(expires: Tick) -> u8 {
    (((expires % TICKS_PER_CYCLE) / TICKS_PER_BUCKET + 1) % NUM_BUCKETS as Tick) as u8
}

struct ExpiresSlot {
    expires: Tick,
    entry: Arc<CacheEntry>,
}

struct BucketInner {
    table: PageTable<ExpiresSlot>,
    /// Cumulative per-5 s counts of deadlines since `last_count_reset`,
    /// letting a flush prove "nothing due yet" without walking pages.
    counts: [i32; COUNTS_LENGTH],
    last_count_reset: Tick,
    min_expires: Tick,
    /// Set while a flush has entries in flight so compaction stays out.
    block_reduce: bool,
}

impl BucketInner {
    fn count_index(&self, t: Tick) -> usize {
        if t <= self.last_count_reset {
            0
        } else {
            ((t - self.last_count_reset) / COUNT_INTERVAL) as usize
        }
    }

    fn add_count(&mut self, t: Tick) {
        let ci = self.count_index(t);
        for i in ci..COUNTS_LENGTH {
            self.counts[i] += 1;
        }
        if t < self.min_expires {
            self.min_expires = t;
        }
    }

    fn remove_count(&mut self, t: Tick) {
        let ci = self.count_index(t);
        for i in ci..COUNTS_LENGTH {
            self.counts[i] -= 1;
        }
    }

    /// Upper bound on entries due at `t`; zero means a flush can bail out.
    fn expires_count(&self, t: Tick) -> usize {
        if self.table.len() == 0 || t < self.min_expires {
            return 0;
        }
        let ci = self.count_index(t);
        if ci >= COUNTS_LENGTH {
            return self.table.len();
        }
        self.counts[ci].max(0) as usize
    }

    fn reset_counts(&mut self, now: Tick) {
        self.counts = [0; COUNTS_LENGTH];
        self.last_count_reset = now;
        self.min_expires = NEVER;
    }

    fn reduce(&mut self) {
        self.table
            .reduce(|_old, new_ref, slot| slot.entry.set_expires_ref(new_ref));
    }
}

struct ExpiresBucket {
    index: u8,
    inner: Mutex<BucketInner>,
}

impl ExpiresBucket {
    fn new(index: u8) -> ExpiresBucket {
        ExpiresBucket {
            index,
            inner: Mutex::new(BucketInner {
                table: PageTable::new(),
                counts: [0; COUNTS_LENGTH],
                last_count_reset: now_ticks(),
                min_expires: NEVER,
                block_reduce: false,
            }),
        }
    }

    fn add(&self, entry: &Arc<CacheEntry>) {
        let expires = entry.expires();
        let mut inner = self.inner.lock();
        let r = inner.table.alloc(ExpiresSlot {
            expires,
            entry: entry.clone(),
        });
        entry.set_expires_link(self.index, r);
        inner.add_count(expires);
    }

    fn remove(&self, entry: &Arc<CacheEntry>) {
        let mut inner = self.inner.lock();
        // re-read under the lock: a concurrent flush may have unlinked it
        let (bucket, r) = entry.expires_link();
        if r.is_invalid() || bucket != self.index {
            return;
        }
        match inner.table.get(r) {
            Some(slot) if Arc::ptr_eq(&slot.entry, entry) => {}
            _ => return,
        }
        let slot = inner.table.free(r);
        inner.remove_count(slot.expires);
        entry.set_expires_link(NO_BUCKET, EntryRef::INVALID);
        if !inner.block_reduce && inner.table.needs_reduce() {
            inner.reduce();
        }
    }

    /// New deadline lands in the same bucket: overwrite in place.
    fn update_in_place(&self, entry: &Arc<CacheEntry>, new_expires: Tick) {
        let mut inner = self.inner.lock();
        let (bucket, r) = entry.expires_link();
        if r.is_invalid() || bucket != self.index {
            return;
        }
        let Some(slot) = inner.table.get(r) else {
            return;
        };
        if !Arc::ptr_eq(&slot.entry, entry) {
            return;
        }
        let old = slot.expires;
        inner.table.get_mut(r).expect("slot verified above").expires = new_expires;
        inner.remove_count(old);
        inner.add_count(new_expires);
        entry.set_expires(new_expires);
    }

    /// Unlinks everything due at `now` under the bucket lock, then deletes
    /// each entry through the shard outside of it.
    fn flush(&self, shard: &Shard, now: Tick) -> usize {
        let expired = {
            let mut inner = self.inner.lock();
            if inner.expires_count(now) == 0 {
                return 0;
            }
            let mut expired_refs = Vec::new();
            let mut survivors = Vec::new();
            inner.table.for_each_used(|r, slot| {
                if slot.expires <= now {
                    expired_refs.push(r);
                } else {
                    survivors.push(slot.expires);
                }
            });
            inner.reset_counts(now);
            for expires in survivors {
                inner.add_count(expires);
            }
            if expired_refs.is_empty() {
                return 0;
            }
            let mut expired = Vec::with_capacity(expired_refs.len());
            for r in expired_refs {
                let slot = inner.table.free(r);
                slot.entry.set_expires_link(NO_BUCKET, EntryRef::INVALID);
                expired.push(slot.entry);
            }
            inner.block_reduce = true;
            expired
        };
        shard.block_insert();
        for entry in &expired {
            shard.remove_entry(entry, RemovedReason::Expired);
        }
        shard.unblock_insert();
        let flushed = expired.len();
        let mut inner = self.inner.lock();
        inner.block_reduce = false;
        if inner.table.needs_reduce() {
            inner.reduce();
        }
        flushed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().table.len()
    }
}

/// Per-shard expiration index: 30 buckets of 20 s each, cycling every
/// 600 s, so a flush touches only bucketed candidates instead of the whole
/// key map.
pub(crate) struct CacheExpires {
    buckets: Vec<ExpiresBucket>,
    last_flush: Mutex<Tick>,
    in_flush: AtomicBool,
}

impl CacheExpires {
    pub(crate) fn new() -> CacheExpires {
        CacheExpires {
            buckets: (0..NUM_BUCKETS as u8).map(ExpiresBucket::new).collect(),
            last_flush: Mutex::new(0),
            in_flush: AtomicBool::new(false),
        }
    }

    pub(crate) fn add(&self, entry: &Arc<CacheEntry>) {
        debug_assert!(entry.has_expiration());
        self.buckets[bucket_for(entry.expires()) as usize].add(entry);
    }

    pub(crate) fn remove(&self, entry: &Arc<CacheEntry>) {
        let (bucket, r) = entry.expires_link();
        if r.is_invalid() || bucket == NO_BUCKET {
            return;
        }
        self.buckets[bucket as usize].remove(entry);
    }

    /// Re-anchor an entry's deadline, moving buckets only when necessary.
    /// A mid-flush entry (no bucket) is left alone; it is already dying.
    pub(crate) fn update(&self, entry: &Arc<CacheEntry>, new_expires: Tick) {
        let (old_bucket, r) = entry.expires_link();
        if r.is_invalid() || old_bucket == NO_BUCKET {
            return;
        }
        let new_bucket = bucket_for(new_expires);
        if old_bucket == new_bucket {
            self.buckets[old_bucket as usize].update_in_place(entry, new_expires);
        } else {
            self.buckets[old_bucket as usize].remove(entry);
            entry.set_expires(new_expires);
            self.buckets[new_bucket as usize].add(entry);
        }
    }

    /// Walk every bucket and expire what is due. Rate-limited to once per
    /// second when `check_delta` is set; concurrent flushes are swallowed.
    pub(crate) fn flush_expired(&self, shard: &Shard, check_delta: bool) -> usize {
        if self.in_flush.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let now = now_ticks();
        let run = {
            let mut last = self.last_flush.lock();
            if check_delta && now >= *last && now - *last < MIN_FLUSH_INTERVAL {
                false
            } else {
                *last = now;
                true
            }
        };
        let flushed = if run {
            self.buckets.iter().map(|b| b.flush(shard, now)).sum()
        } else {
            0
        };
        self.in_flush.store(false, Ordering::SeqCst);
        if flushed > 0 {
            tracing::trace!(flushed, "expired entries flushed");
        }
        flushed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Priority;
    use std::time::Duration;

    fn entry_expiring_at(key: &str, expires: Tick) -> Arc<CacheEntry> {
        let e = CacheEntry::new(
            Arc::from(key),
            Arc::new(()),
            now_ticks(),
            Some(std::time::UNIX_EPOCH + Duration::from_millis(expires)),
            Duration::ZERO,
            Priority::Default,
            None,
            Vec::new(),
        );
        e
    }

    #[test]
    fn bucket_math_covers_the_cycle() {
        assert_eq!(bucket_for(0), 1);
        assert_eq!(bucket_for(TICKS_PER_BUCKET - 1), 1);
        assert_eq!(bucket_for(TICKS_PER_BUCKET), 2);
        // the last slice of a cycle wraps to bucket 0
        assert_eq!(bucket_for(TICKS_PER_CYCLE - 1), 0);
        assert_eq!(bucket_for(TICKS_PER_CYCLE), 1);
    }

    #[test]
    fn add_links_and_remove_unlinks() {
        let wheel = CacheExpires::new();
        let e = entry_expiring_at("k", now_ticks() + 5_000);
        assert!(!e.in_expires());
        wheel.add(&e);
        let (bucket, r) = e.expires_link();
        assert_eq!(bucket, bucket_for(e.expires()));
        assert!(!r.is_invalid());
        assert_eq!(wheel.len(), 1);

        wheel.remove(&e);
        assert!(!e.in_expires());
        assert_eq!(e.expires_link().0, NO_BUCKET);
        assert_eq!(wheel.len(), 0);
        // removing again is harmless
        wheel.remove(&e);
    }

    #[test]
    fn update_within_bucket_keeps_slot() {
        let wheel = CacheExpires::new();
        let base = now_ticks() - (now_ticks() % TICKS_PER_BUCKET);
        let e = entry_expiring_at("k", base + 1_000);
        wheel.add(&e);
        let before = e.expires_link();
        wheel.update(&e, base + 2_000);
        assert_eq!(e.expires(), base + 2_000);
        assert_eq!(e.expires_link(), before);
    }

    #[test]
    fn update_across_buckets_relinks() {
        let wheel = CacheExpires::new();
        let base = now_ticks() - (now_ticks() % TICKS_PER_BUCKET);
        let e = entry_expiring_at("k", base + 1_000);
        wheel.add(&e);
        let (old_bucket, _) = e.expires_link();
        wheel.update(&e, base + 1_000 + TICKS_PER_BUCKET);
        let (new_bucket, r) = e.expires_link();
        assert_ne!(old_bucket, new_bucket);
        assert!(!r.is_invalid());
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn histogram_early_out() {
        let bucket = ExpiresBucket::new(0);
        let now = now_ticks();
        let e = entry_expiring_at("k", now + 60_000);
        bucket.add(&e);
        // nothing due yet
        assert_eq!(bucket.inner.lock().expires_count(now), 0);
        // due once the deadline passes
        assert!(bucket.inner.lock().expires_count(now + 61_000) > 0);
    }
}
