use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TimerState {
    interval: Duration,
    cancelled: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A cancellable fixed-interval background task on its own thread. Each
/// cycle waits `interval` minus the previous run's duration, then runs the
/// callback. Changing the interval wakes the waiter and restarts the wait
/// in full, so a tick may be skipped across an update.
pub(crate) struct PeriodicCallback {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicCallback {
    pub(crate) fn start(
        name: &str,
        interval: Duration,
        callback: impl Fn() + Send + 'static,
    ) -> PeriodicCallback {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval,
                cancelled: false,
            }),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ocache-{name}"))
            .spawn(move || {
                let mut last_run = Duration::ZERO;
                loop {
                    {
                        let mut st = worker.state.lock();
                        loop {
                            if st.cancelled {
                                return;
                            }
                            let wait = st.interval.saturating_sub(last_run);
                            let timed_out = worker.cond.wait_for(&mut st, wait).timed_out();
                            if st.cancelled {
                                return;
                            }
                            if timed_out {
                                break;
                            }
                            // woken by an interval change: start a fresh wait
                            last_run = Duration::ZERO;
                        }
                    }
                    let started = Instant::now();
                    callback();
                    last_run = started.elapsed();
                }
            })
            .expect("spawning timer thread");
        PeriodicCallback {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    /// Takes effect on the next wait; safe to call from inside the callback.
    pub(crate) fn set_interval(&self, interval: Duration) {
        let mut st = self.shared.state.lock();
        if st.interval == interval {
            return;
        }
        st.interval = interval;
        self.shared.cond.notify_all();
    }

    /// Stops the worker and joins it. Idempotent; a no-op when called from
    /// the worker itself (the thread exits on its own).
    pub(crate) fn cancel(&self) {
        {
            let mut st = self.shared.state.lock();
            st.cancelled = true;
            self.shared.cond.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PeriodicCallback {
    fn drop(&mut self) {
        self.cancel();
    }
}
