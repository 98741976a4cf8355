use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::cache::CacheInner;
use crate::entry::{now_ticks, Tick};
use crate::memory::{
    memory_cache_manager, CacheMemoryMonitor, PhysicalMemoryMonitor, APPROX_BYTES_PER_ENTRY,
};
use crate::timer::PeriodicCallback;

const INTERVAL_HIGH_PRESSURE: Duration = Duration::from_secs(5);
const INTERVAL_LOW_PRESSURE: Duration = Duration::from_secs(30);

/// What the last pressure trim did.
#[derive(Default, Clone)]
pub(crate) struct TrimStats {
    pub last_trim_ticks: Tick,
    pub last_trim_percent: i32,
    pub last_trim_duration: Duration,
    pub count_before_trim: usize,
    pub last_trim_count: usize,
}

pub(crate) struct StatsCore {
    cache: Weak<CacheInner>,
    pub(crate) physical: PhysicalMemoryMonitor,
    pub(crate) cache_mon: CacheMemoryMonitor,
    config_interval: Duration,
    timer: OnceCell<Weak<PeriodicCallback>>,
    in_tick: AtomicBool,
    trim: Mutex<TrimStats>,
}

/// Periodic sampler: refresh both monitors, adapt the polling interval to
/// the pressure picture, and trim the cache when either monitor asks.
pub(crate) struct CacheStatistics {
    core: Arc<StatsCore>,
    timer: Arc<PeriodicCallback>,
}

impl CacheStatistics {
    pub(crate) fn new(
        cache: Weak<CacheInner>,
        polling_interval: Duration,
        cache_memory_limit_mb: Option<u64>,
        physical_memory_limit_pct: Option<u32>,
        total_ram: u64,
    ) -> CacheStatistics {
        let core = Arc::new(StatsCore {
            cache,
            physical: PhysicalMemoryMonitor::new(physical_memory_limit_pct),
            cache_mon: CacheMemoryMonitor::new(cache_memory_limit_mb, total_ram),
            config_interval: polling_interval,
            timer: OnceCell::new(),
            in_tick: AtomicBool::new(false),
            trim: Mutex::new(TrimStats::default()),
        });
        let tick_core = core.clone();
        let timer = Arc::new(PeriodicCallback::start("stats", polling_interval, move || {
            tick_core.tick();
        }));
        core.timer
            .set(Arc::downgrade(&timer))
            .unwrap_or_else(|_| unreachable!("timer installed once"));
        CacheStatistics { core, timer }
    }

    pub(crate) fn core(&self) -> &Arc<StatsCore> {
        &self.core
    }

    pub(crate) fn polling_interval(&self) -> Duration {
        self.timer.interval()
    }
}

impl Drop for CacheStatistics {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

impl StatsCore {
    pub(crate) fn trim_stats(&self) -> TrimStats {
        self.trim.lock().clone()
    }

    /// One statistics pass. Re-entry is swallowed so a slow trim cannot
    /// stack ticks.
    pub(crate) fn tick(&self) {
        if self.in_tick.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run_tick();
        self.in_tick.store(false, Ordering::SeqCst);
    }

    fn run_tick(&self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let count = cache.count();
        let approx_size = count as u64 * APPROX_BYTES_PER_ENTRY;
        if let Some(manager) = memory_cache_manager() {
            manager.update_cache_size(approx_size, cache.name());
        }
        self.cache_mon.update(approx_size);
        self.physical.update();
        self.adjust_timer();
        let (last_trim, last_percent) = {
            let t = self.trim.lock();
            (t.last_trim_ticks, t.last_trim_percent)
        };
        let percent = self
            .physical
            .percent_to_trim(last_trim, last_percent)
            .max(self.cache_mon.percent_to_trim());
        if percent <= 0 {
            return;
        }
        let started = Instant::now();
        let trimmed = cache.trim(percent as usize);
        if trimmed > 0 {
            let duration = started.elapsed();
            let mut t = self.trim.lock();
            t.last_trim_ticks = now_ticks();
            t.last_trim_percent = percent;
            t.last_trim_duration = duration;
            t.count_before_trim = count;
            t.last_trim_count = trimmed;
            tracing::debug!(percent, count, trimmed, ?duration, "trimmed under memory pressure");
        }
    }

    /// Poll fast while above high pressure, at a moderate pace while close
    /// to the low watermark, and at the configured interval when idle.
    fn adjust_timer(&self) {
        let Some(timer) = self.timer.get().and_then(Weak::upgrade) else {
            return;
        };
        if self.physical.is_above_high() || self.cache_mon.is_above_high() {
            if timer.interval() > INTERVAL_HIGH_PRESSURE {
                timer.set_interval(INTERVAL_HIGH_PRESSURE);
            }
            return;
        }
        if self.physical.last_pressure() > self.physical.pressure_low() / 2
            || self.cache_mon.last_pressure() > self.cache_mon.pressure_low() / 2
        {
            timer.set_interval(self.config_interval.min(INTERVAL_LOW_PRESSURE));
            return;
        }
        timer.set_interval(self.config_interval);
    }
}
