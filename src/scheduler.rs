//! Timer runtime for housekeeping, leak and end-of-life timers
//!
//! Each pool owns a current-thread tokio runtime driven by one named thread.
//! Timers are tokio tasks; cancelling a [`ScheduledTask`] aborts its task.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, warn};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

const MIN_PERIOD: Duration = Duration::from_millis(1);
/// Periods past this are treated as this; tokio deadlines must stay representable.
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Handle to a timer started by a [`Scheduler`].
pub(crate) struct ScheduledTask {
    status: Arc<AtomicU8>,
    abort: Option<AbortHandle>,
}

impl ScheduledTask {
    /// Prevent any further runs. Returns `true` when the task was waiting
    /// for its next run and will now never make it.
    pub fn cancel(&self) -> bool {
        let stopped = self
            .status
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !stopped {
            // A fixed-rate task mid-run must not be rearmed.
            let _ = self.status.compare_exchange(
                RUNNING,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        stopped
    }
}

/// Delayed and fixed-rate tasks on a dedicated timer thread.
pub(crate) struct Scheduler {
    name: String,
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(name: String) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();

        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            // Either a stop signal or the sender being dropped ends the loop;
            // outstanding timers are dropped with the runtime.
            runtime.block_on(async {
                let _ = stopped.await;
            });
        })?;

        Ok(Self {
            name,
            handle,
            stop: Mutex::new(Some(stop)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run `action` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let status = Arc::new(AtomicU8::new(PENDING));
        let task_status = Arc::clone(&status);
        let name = self.name.clone();

        self.spawn(status, async move {
            time::sleep(delay).await;
            if begin_run(&task_status) {
                run_guarded(&name, action);
                let _ = task_status.compare_exchange(
                    RUNNING,
                    DONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        })
    }

    /// Run `action` after `initial_delay`, then every `period` until cancelled.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        action: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + 'static,
    {
        let status = Arc::new(AtomicU8::new(PENDING));
        let task_status = Arc::clone(&status);
        let name = self.name.clone();

        self.spawn(status, async move {
            time::sleep(initial_delay).await;
            let mut ticker = time::interval(period.clamp(MIN_PERIOD, MAX_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !begin_run(&task_status) {
                    return;
                }
                run_guarded(&name, &action);
                if task_status
                    .compare_exchange(RUNNING, PENDING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
            }
        })
    }

    fn spawn<Fut>(&self, status: Arc<AtomicU8>, timer: Fut) -> ScheduledTask
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = self.stop.lock();
        if stop.is_none() {
            status.store(CANCELLED, Ordering::Release);
            return ScheduledTask {
                status,
                abort: None,
            };
        }

        let abort = self.handle.spawn(timer).abort_handle();
        drop(stop);
        ScheduledTask {
            status,
            abort: Some(abort),
        }
    }

    /// Stop the timer thread and wait up to `timeout` for it to exit.
    pub fn shutdown(&self, timeout: Duration) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }

        let deadline = Instant::now().checked_add(timeout);
        while !worker.is_finished() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Timed-out waiting for {} to shut down", self.name);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let _ = worker.join();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.get_mut().take();
    }
}

fn begin_run(status: &AtomicU8) -> bool {
    status
        .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn run_guarded(name: &str, action: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(action)).is_err() {
        error!("{} - Scheduled task panicked", name);
    }
}
