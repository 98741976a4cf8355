use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sysinfo::System;

use crate::entry::{now_ticks, Tick};

const HISTORY_COUNT: usize = 6;
const MEGABYTE: u64 = 1 << 20;

/// Fixed per-entry estimate used for the cache's approximate byte size.
pub(crate) const APPROX_BYTES_PER_ENTRY: u64 = 1024;

const MIN_TRIM_PERCENT: i64 = 10;
const MAX_TRIM_PERCENT: i64 = 50;
/// Trim percentages amortize to one full pass over the cache in roughly
/// this long.
const TARGET_TRIM_INTERVAL: Tick = 5 * 60 * 1000;

/// Process-wide seam for host-side size accounting. The cache reports its
/// approximate size on every statistics tick and announces teardown.
pub trait MemoryCacheManager: Send + Sync {
    fn update_cache_size(&self, bytes: u64, cache_name: &str);
    fn release_cache(&self, cache_name: &str);
}

static MEMORY_CACHE_MANAGER: OnceCell<Arc<dyn MemoryCacheManager>> = OnceCell::new();

/// Installs the process-wide cache manager. Write-once: a second call is a
/// programming error and panics.
pub fn set_memory_cache_manager(manager: Arc<dyn MemoryCacheManager>) {
    if MEMORY_CACHE_MANAGER.set(manager).is_err() {
        panic!("memory cache manager may only be set once per process");
    }
}

pub(crate) fn memory_cache_manager() -> Option<&'static Arc<dyn MemoryCacheManager>> {
    MEMORY_CACHE_MANAGER.get()
}

/// Ring of the six most recent pressure samples plus the watermarks they
/// are judged against.
struct Pressure {
    history: [i32; HISTORY_COUNT],
    idx: usize,
    high: i32,
    low: i32,
}

impl Pressure {
    fn new(high: i32, low: i32, initial: i32) -> Pressure {
        Pressure {
            history: [initial; HISTORY_COUNT],
            idx: 0,
            high,
            low,
        }
    }

    fn record(&mut self, sample: i32) {
        self.idx = (self.idx + 1) % HISTORY_COUNT;
        self.history[self.idx] = sample;
    }

    fn last(&self) -> i32 {
        self.history[self.idx]
    }

    fn is_above_high(&self) -> bool {
        self.last() >= self.high
    }
}

/// Default high watermark for global memory load, keyed on total RAM.
fn default_high_watermark(total_bytes: u64) -> i32 {
    if total_bytes >= 0x1_0000_0000 {
        99
    } else if total_bytes >= 0x8000_0000 {
        98
    } else if total_bytes >= 0x4000_0000 {
        97
    } else if total_bytes >= 0x3000_0000 {
        96
    } else {
        95
    }
}

struct PhysicalInner {
    pressure: Pressure,
    sys: System,
    warned: bool,
}

/// Samples global memory load through `sysinfo`. A failed sample degrades
/// to pressure 0, which disables trimming while the cache keeps serving.
pub(crate) struct PhysicalMemoryMonitor {
    inner: Mutex<PhysicalInner>,
}

impl PhysicalMemoryMonitor {
    pub(crate) fn new(limit_percentage: Option<u32>) -> PhysicalMemoryMonitor {
        let mut sys = System::new();
        sys.refresh_memory();
        let high = match limit_percentage {
            Some(p) => (p as i32).max(3),
            None => default_high_watermark(sys.total_memory()),
        };
        let low = (high - 9).max(1);
        let mut inner = PhysicalInner {
            pressure: Pressure::new(high, low, 0),
            sys,
            warned: false,
        };
        let initial = Self::sample(&mut inner);
        inner.pressure = Pressure::new(high, low, initial);
        PhysicalMemoryMonitor {
            inner: Mutex::new(inner),
        }
    }

    fn sample(inner: &mut PhysicalInner) -> i32 {
        inner.sys.refresh_memory();
        let total = inner.sys.total_memory();
        if total == 0 {
            if !inner.warned {
                inner.warned = true;
                tracing::warn!("memory query returned no total RAM; pressure trimming disabled");
            }
            return 0;
        }
        let used = total.saturating_sub(inner.sys.available_memory());
        (used * 100 / total) as i32
    }

    pub(crate) fn update(&self) {
        let mut inner = self.inner.lock();
        let sample = Self::sample(&mut inner);
        inner.pressure.record(sample);
    }

    pub(crate) fn is_above_high(&self) -> bool {
        self.inner.lock().pressure.is_above_high()
    }

    pub(crate) fn last_pressure(&self) -> i32 {
        self.inner.lock().pressure.last()
    }

    pub(crate) fn pressure_low(&self) -> i32 {
        self.inner.lock().pressure.low
    }

    /// Percentage to trim while above the high watermark, sized so that
    /// repeated trims amortize to one full pass over the cache in about
    /// five minutes, clamped to 10..=50.
    pub(crate) fn percent_to_trim(&self, last_trim: Tick, last_trim_percent: i32) -> i32 {
        if !self.is_above_high() {
            return 0;
        }
        let since = now_ticks().saturating_sub(last_trim);
        let mut percent = if since > 0 {
            (last_trim_percent as i64 * TARGET_TRIM_INTERVAL as i64 / since as i64)
                .min(MAX_TRIM_PERCENT)
        } else {
            0
        };
        percent = percent.max(MIN_TRIM_PERCENT);
        percent as i32
    }

    pub(crate) fn pressure_high(&self) -> i32 {
        self.inner.lock().pressure.high
    }

    #[cfg(test)]
    pub(crate) fn force_pressure_for_test(&self, value: i32) {
        self.inner.lock().pressure.record(value);
    }
}

/// Auto cap when none is configured: 60 % of RAM, bounded by address space.
fn auto_cache_limit(total_ram: u64) -> u64 {
    if total_ram == 0 {
        return 0;
    }
    let three_fifths = total_ram / 5 * 3;
    if cfg!(target_pointer_width = "64") {
        three_fifths.min(1 << 40)
    } else {
        three_fifths.min(800 * MEGABYTE)
    }
}

struct CacheMonInner {
    pressure: Pressure,
    last_size: u64,
}

/// Tracks the cache's own approximate byte size against a byte cap.
/// Without a cap (RAM unknown) the watermarks sit at 99/97 and the pressure
/// stays 0, so trimming never triggers from this monitor.
pub(crate) struct CacheMemoryMonitor {
    inner: Mutex<CacheMonInner>,
    limit: u64,
}

impl CacheMemoryMonitor {
    pub(crate) fn new(limit_megabytes: Option<u64>, total_ram: u64) -> CacheMemoryMonitor {
        let limit = match limit_megabytes {
            Some(mb) => mb.saturating_mul(MEGABYTE),
            None => auto_cache_limit(total_ram),
        };
        let (high, low) = if limit == 0 { (99, 97) } else { (100, 80) };
        CacheMemoryMonitor {
            inner: Mutex::new(CacheMonInner {
                pressure: Pressure::new(high, low, 0),
                last_size: 0,
            }),
            limit,
        }
    }

    pub(crate) fn limit_bytes(&self) -> u64 {
        self.limit
    }

    pub(crate) fn update(&self, approx_bytes: u64) {
        let mut inner = self.inner.lock();
        inner.last_size = approx_bytes;
        let pressure = if self.limit == 0 {
            0
        } else {
            (approx_bytes.min(self.limit) * 100 / self.limit) as i32
        };
        inner.pressure.record(pressure);
    }

    pub(crate) fn is_above_high(&self) -> bool {
        self.inner.lock().pressure.is_above_high()
    }

    pub(crate) fn last_pressure(&self) -> i32 {
        self.inner.lock().pressure.last()
    }

    pub(crate) fn pressure_low(&self) -> i32 {
        self.inner.lock().pressure.low
    }

    /// Percentage of the cache that would bring it back under its cap.
    pub(crate) fn percent_to_trim(&self) -> i32 {
        let inner = self.inner.lock();
        if !inner.pressure.is_above_high() {
            return 0;
        }
        let size = inner.last_size;
        if size > self.limit && size > 0 {
            (((size - self.limit) * 100 / size) as i32).min(100)
        } else {
            0
        }
    }
}
