//! Detection of resources held longer than the leak threshold

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::millis;
use crate::metrics::MetricsTracker;
use crate::scheduler::{ScheduledTask, Scheduler};

/// Hands out a [`LeakTask`] per borrow, using the current threshold.
pub(crate) struct LeakDetector {
    pool_name: String,
    threshold_ms: AtomicU64,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsTracker>,
}

impl LeakDetector {
    pub fn new(
        pool_name: String,
        threshold: Duration,
        scheduler: Arc<Scheduler>,
        metrics: Arc<MetricsTracker>,
    ) -> Self {
        Self {
            pool_name,
            threshold_ms: AtomicU64::new(millis(threshold)),
            scheduler,
            metrics,
        }
    }

    pub fn update_threshold(&self, threshold: Duration) {
        self.threshold_ms.store(millis(threshold), Ordering::Release);
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms.load(Ordering::Acquire))
    }

    /// Arm a leak timer for the entry just handed to the calling thread.
    pub fn schedule(&self, entry_id: u64) -> LeakTask {
        let threshold = self.threshold();
        if threshold.is_zero() {
            return LeakTask::disabled();
        }

        let report = Arc::new(LeakReport {
            pool_name: self.pool_name.clone(),
            entry_id,
            thread_name: thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            backtrace: Backtrace::capture(),
            state: AtomicU8::new(ARMED),
        });

        let fired = Arc::clone(&report);
        let metrics = Arc::clone(&self.metrics);
        let timer = self.scheduler.schedule(threshold, move || {
            fired.fire(&metrics);
        });

        LeakTask {
            armed: Some(Armed {
                report,
                timer,
                metrics: Arc::clone(&self.metrics),
            }),
        }
    }
}

const ARMED: u8 = 0;
const LEAKED: u8 = 1;
const RETURNED: u8 = 2;

struct LeakReport {
    pool_name: String,
    entry_id: u64,
    thread_name: String,
    backtrace: Backtrace,
    /// ARMED until either the timer (LEAKED) or the holder (RETURNED) wins.
    state: AtomicU8,
}

impl LeakReport {
    /// Report the leak unless the resource already came back.
    fn fire(&self, metrics: &MetricsTracker) -> bool {
        if self
            .state
            .compare_exchange(ARMED, LEAKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        metrics.record_leak_detected();
        warn!(
            "{} - Resource leak detection triggered for entry {} on thread {}, backtrace follows\n{}",
            self.pool_name, self.entry_id, self.thread_name, self.backtrace
        );
        true
    }

    /// Mark the resource returned. `true` if the leak had already been reported.
    fn settle(&self) -> bool {
        match self
            .state
            .compare_exchange(ARMED, RETURNED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(found) => found == LEAKED,
        }
    }
}

struct Armed {
    report: Arc<LeakReport>,
    timer: ScheduledTask,
    metrics: Arc<MetricsTracker>,
}

/// Leak timer for a single borrow.
pub(crate) struct LeakTask {
    armed: Option<Armed>,
}

impl LeakTask {
    pub fn disabled() -> Self {
        Self { armed: None }
    }

    pub fn is_leaked(&self) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|armed| armed.report.state.load(Ordering::Acquire) == LEAKED)
    }

    /// Disarm on return; reports recovery if the warning already went out.
    pub fn cancel(&mut self) {
        let Some(armed) = self.armed.take() else {
            return;
        };

        armed.timer.cancel();
        if armed.report.settle() {
            armed.metrics.record_leak_recovered();
            info!(
                "{} - Previously reported leaked entry {} on thread {} was returned to the pool (unleaked)",
                armed.report.pool_name, armed.report.entry_id, armed.report.thread_name
            );
        }
    }
}
