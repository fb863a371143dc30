//! Pool orchestration: acquire, recycle, growth, eviction, housekeeping and shutdown

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::bag::{BagStateListener, EntryState, ResourceBag};
use crate::clock::{Clock, MonotonicClock, elapsed_display};
use crate::config::{PoolConfiguration, PoolSettings, millis};
use crate::entry::PoolEntry;
use crate::errors::{PoolError, PoolResult, ResourceSetupError};
use crate::executor::{Rejection, TaskQueue};
use crate::factory::{Observer, ResourceFactory};
use crate::health::HealthStatus;
use crate::leak::{LeakDetector, LeakTask};
use crate::metrics::{MetricsExporter, MetricsTracker, PoolMetrics};
use crate::scheduler::{ScheduledTask, Scheduler};

const POOL_NORMAL: u8 = 0;
const POOL_SHUTDOWN: u8 = 1;

const EVICTED_MESSAGE: &str = "(resource was evicted)";
const DEAD_MESSAGE: &str = "(resource is dead)";
const ABORTED_MESSAGE: &str = "(resource aborted during shutdown)";

const HOUSEKEEPING_INITIAL_DELAY: Duration = Duration::from_millis(100);
/// Tolerated backwards clock movement between housekeeping passes (NTP slew).
const CLOCK_SLACK_MS: u64 = 128;

const CREATE_BACKOFF_START: Duration = Duration::from_millis(250);
const CREATE_BACKOFF_CAP: Duration = Duration::from_secs(10);
const INITIALIZATION_RETRY_PAUSE: Duration = Duration::from_secs(1);

const ADDER_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
const ABORT_WINDOW: Duration = Duration::from_secs(10);
const CLOSER_SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

type ResourceOf<F> = <F as ResourceFactory>::Resource;

/// A resource checked out of a [`ResourcePool`]
///
/// Dereferences to the resource and hands it back to the pool when dropped.
pub struct PooledResource<F: ResourceFactory> {
    resource: Option<ResourceOf<F>>,
    entry: Arc<PoolEntry<ResourceOf<F>>>,
    pool: Arc<PoolInner<F>>,
    leak_task: LeakTask,
}

impl<F: ResourceFactory> PooledResource<F> {
    /// Identifier of the pool entry holding this resource
    pub fn entry_id(&self) -> u64 {
        self.entry.id()
    }

    /// Whether the leak detector has already reported this borrow
    pub fn is_leaked(&self) -> bool {
        self.leak_task.is_leaked()
    }

    /// Close the resource instead of returning it to the pool
    pub fn evict(mut self) {
        if let Some(resource) = self.resource.take() {
            self.leak_task.cancel();
            self.entry.restore_resource(resource);
            self.pool
                .soft_evict(&self.entry, "(resource evicted by its holder)", true);
        }
    }
}

impl<F: ResourceFactory> Deref for PooledResource<F> {
    type Target = ResourceOf<F>;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("resource is present until the guard is consumed")
    }
}

impl<F: ResourceFactory> DerefMut for PooledResource<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .expect("resource is present until the guard is consumed")
    }
}

impl<F: ResourceFactory> Drop for PooledResource<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.leak_task.cancel();
            self.pool.recycle(Arc::clone(&self.entry), resource);
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for PooledResource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.pool.name)
            .field("entry", &self.entry)
            .finish()
    }
}

/// Builder for a [`ResourcePool`]
pub struct PoolBuilder<F: ResourceFactory> {
    factory: F,
    config: PoolConfiguration,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn Observer>>,
}

impl<F: ResourceFactory> PoolBuilder<F> {
    pub fn config(mut self, config: PoolConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Time source for entry timestamps and housekeeping
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the configuration, start background workers and begin filling the pool.
    pub fn build(self) -> PoolResult<ResourcePool<F>> {
        let config = self.config.validate()?;
        let name = config.pool_name.clone();

        let scheduler = Arc::new(
            Scheduler::new(format!("{name} housekeeper")).map_err(|e| spawn_failure(&name, e))?,
        );
        let adder = TaskQueue::new(
            format!("{name} resource adder"),
            1,
            config.max_pool_size,
            Rejection::Discard,
        )
        .map_err(|e| spawn_failure(&name, e))?;
        let closer = TaskQueue::new(
            format!("{name} resource closer"),
            1,
            config.max_pool_size,
            Rejection::CallerRuns,
        )
        .map_err(|e| spawn_failure(&name, e))?;

        let metrics = Arc::new(MetricsTracker::new());
        let leak_detector = LeakDetector::new(
            name.clone(),
            config.leak_detection_threshold,
            Arc::clone(&scheduler),
            Arc::clone(&metrics),
        );
        let settings = PoolSettings::from_config(&config);
        let period_ms = millis(config.housekeeping_period);
        let started_at = self.clock.now_millis();

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner<F>>| {
            let listener: Weak<dyn BagStateListener> = weak.clone();
            PoolInner {
                name: name.clone(),
                config,
                settings,
                factory: self.factory,
                bag: ResourceBag::new(listener),
                state: AtomicU8::new(POOL_NORMAL),
                clock: self.clock,
                observer: self.observer,
                metrics,
                scheduler,
                leak_detector,
                adder,
                closer,
                housekeeper: Mutex::new(None),
                housekeeping_previous: AtomicU64::new(started_at.saturating_sub(period_ms)),
                fill_lock: Mutex::new(()),
                last_failure: Mutex::new(None),
                next_entry_id: AtomicU64::new(1),
                weak_self: weak.clone(),
            }
        });

        if let Err(err) = inner.check_fail_fast() {
            inner.shutdown();
            return Err(err);
        }

        let weak = Arc::downgrade(&inner);
        let housekeeper = inner.scheduler.schedule_at_fixed_rate(
            HOUSEKEEPING_INITIAL_DELAY,
            inner.config.housekeeping_period,
            move || {
                if let Some(pool) = weak.upgrade() {
                    pool.housekeep();
                }
            },
        );
        *inner.housekeeper.lock() = Some(housekeeper);

        inner.fill_pool();
        info!("{} - Start completed.", name);

        Ok(ResourcePool { inner })
    }
}

fn spawn_failure(pool: &str, err: std::io::Error) -> PoolError {
    PoolError::Initialization {
        pool: pool.to_string(),
        cause: Some(Arc::new(ResourceSetupError::with_source(
            "failed to start pool worker thread",
            Box::new(err),
        ))),
    }
}

/// A bounded pool of long-lived resources
///
/// Cloning is cheap; every clone refers to the same pool.
///
/// # Examples
///
/// ```
/// use esox_connpool::{BoxError, PoolConfiguration, ResourceFactory, ResourcePool};
/// use std::time::Duration;
///
/// struct Numbers;
///
/// impl ResourceFactory for Numbers {
///     type Resource = u32;
///
///     fn create(&self) -> Result<u32, BoxError> {
///         Ok(42)
///     }
///
///     fn validate(&self, _resource: &mut u32, _timeout: Duration) -> bool {
///         true
///     }
/// }
///
/// let pool = ResourcePool::new(Numbers, PoolConfiguration::new().with_max_pool_size(2)).unwrap();
/// {
///     let number = pool.acquire().unwrap();
///     assert_eq!(*number, 42);
/// }
/// pool.shutdown();
/// ```
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("total", &self.total())
            .field("active", &self.active())
            .field("idle", &self.idle())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Start a pool with the system monotonic clock and no observer
    pub fn new(factory: F, config: PoolConfiguration) -> PoolResult<Self> {
        Self::builder(factory).config(config).build()
    }

    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder {
            factory,
            config: PoolConfiguration::default(),
            clock: Arc::new(MonotonicClock::new()),
            observer: None,
        }
    }

    /// Acquire a resource, waiting at most the configured connection timeout
    pub fn acquire(&self) -> PoolResult<PooledResource<F>> {
        self.inner.acquire(self.inner.settings.connection_timeout())
    }

    /// Acquire a resource, waiting at most `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledResource<F>> {
        self.inner.acquire(timeout)
    }

    /// Acquire a resource without blocking the async runtime
    pub async fn acquire_async(&self) -> PoolResult<PooledResource<F>> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.acquire())
            .await
            .map_err(|_| PoolError::Cancelled)?
    }

    /// Resources currently checked out
    pub fn active(&self) -> usize {
        self.inner.bag.count(EntryState::Using)
    }

    /// Resources free in the pool
    pub fn idle(&self) -> usize {
        self.inner.bag.count(EntryState::Free)
    }

    /// Every resource the pool holds
    pub fn total(&self) -> usize {
        self.inner.bag.size()
    }

    /// Callers blocked waiting for a resource
    pub fn waiting(&self) -> usize {
        self.inner.bag.waiting()
    }

    /// Evict every resource; idle ones close now, borrowed ones when next seen
    pub fn soft_evict_all(&self) {
        self.inner.soft_evict_all();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    /// Runtime-mutable timeouts
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.is_normal()
    }

    /// Shut the pool down, closing idle resources and aborting borrowed ones.
    /// Calling it again has no effect.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics_snapshot()
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_metrics(&self.metrics())
    }

    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format, labelled with the pool name
    pub fn export_metrics_prometheus(&self, tags: Option<&HashMap<String, String>>) -> String {
        MetricsExporter::export_prometheus(&self.metrics(), &self.inner.name, tags)
    }
}

struct PoolInner<F: ResourceFactory> {
    name: String,
    config: PoolConfiguration,
    settings: PoolSettings,
    factory: F,
    bag: ResourceBag<PoolEntry<ResourceOf<F>>>,
    state: AtomicU8,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn Observer>>,
    metrics: Arc<MetricsTracker>,
    scheduler: Arc<Scheduler>,
    leak_detector: LeakDetector,
    adder: TaskQueue,
    closer: TaskQueue,
    housekeeper: Mutex<Option<ScheduledTask>>,
    housekeeping_previous: AtomicU64,
    fill_lock: Mutex<()>,
    last_failure: Mutex<Option<Arc<ResourceSetupError>>>,
    next_entry_id: AtomicU64,
    weak_self: Weak<PoolInner<F>>,
}

impl<F: ResourceFactory> PoolInner<F> {
    fn is_normal(&self) -> bool {
        self.state.load(Ordering::Acquire) == POOL_NORMAL
    }

    fn acquire(self: &Arc<Self>, hard_timeout: Duration) -> PoolResult<PooledResource<F>> {
        if !self.is_normal() {
            return Err(PoolError::Closed(self.name.clone()));
        }

        let start = Instant::now();
        let mut timeout = hard_timeout;
        loop {
            let Some(entry) = self.bag.borrow(timeout) else {
                break;
            };

            let now = self.clock.now_millis();
            let Some(mut resource) = entry.take_resource() else {
                debug!("{} - Entry {} has no resource, discarding it", self.name, entry.id());
                let _ = self.bag.remove(&entry);
                timeout = hard_timeout.saturating_sub(start.elapsed());
                if timeout.is_zero() {
                    break;
                }
                continue;
            };

            let evicted = entry.is_marked_evicted();
            if evicted
                || (self.clock.elapsed_since(entry.last_accessed()) > self.config.alive_bypass_window
                    && !self
                        .factory
                        .validate(&mut resource, self.settings.validation_timeout()))
            {
                entry.restore_resource(resource);
                self.close_entry(&entry, if evicted { EVICTED_MESSAGE } else { DEAD_MESSAGE });
                timeout = hard_timeout.saturating_sub(start.elapsed());
                if timeout.is_zero() {
                    break;
                }
                continue;
            }

            entry.set_last_borrowed(now);
            self.factory.on_acquire(&mut resource);
            self.metrics.record_acquired();
            if let Some(observer) = &self.observer {
                observer.on_acquire_wait(start.elapsed());
            }
            let leak_task = self.leak_detector.schedule(entry.id());

            return Ok(PooledResource {
                resource: Some(resource),
                entry,
                pool: Arc::clone(self),
                leak_task,
            });
        }

        if !self.is_normal() {
            return Err(PoolError::Closed(self.name.clone()));
        }

        self.metrics.record_timeout();
        if let Some(observer) = &self.observer {
            observer.on_timeout();
        }
        self.log_pool_state("Timeout failure ");
        Err(PoolError::Timeout {
            pool: self.name.clone(),
            waited: start.elapsed(),
            cause: self.last_failure.lock().clone(),
        })
    }

    fn recycle(self: &Arc<Self>, entry: Arc<PoolEntry<ResourceOf<F>>>, mut resource: ResourceOf<F>) {
        self.metrics.record_released();
        if let Some(observer) = &self.observer {
            observer.on_usage(self.clock.elapsed_since(entry.last_borrowed()));
        }

        if let Err(err) = self.factory.reset(&mut resource) {
            warn!(
                "{} - Failed to reset resource {} on return, retiring it: {}",
                self.name,
                entry.id(),
                err
            );
            entry.mark_evicted();
        }

        entry.set_last_accessed(self.clock.now_millis());
        entry.restore_resource(resource);

        if entry.is_marked_evicted() {
            let reason = if entry.is_aborted() { ABORTED_MESSAGE } else { EVICTED_MESSAGE };
            self.close_entry(&entry, reason);
        } else if self.bag.requite(Arc::clone(&entry)).is_err() {
            // Removed underneath the holder by the shutdown abort pass.
            if let Some(resource) = entry.close() {
                self.close_resource(entry.id(), resource, ABORTED_MESSAGE);
            }
        }
    }

    /// Remove the entry from the bag and close its resource on the closer thread.
    fn close_entry(self: &Arc<Self>, entry: &Arc<PoolEntry<ResourceOf<F>>>, reason: &'static str) {
        if self.bag.remove(entry).is_err() {
            return;
        }
        let Some(resource) = entry.close() else {
            return;
        };

        let id = entry.id();
        debug!(
            "{} - Retiring resource {} after {}: {}",
            self.name,
            id,
            elapsed_display(entry.created_at(), self.clock.now_millis()),
            reason
        );

        let pool = Arc::clone(self);
        self.closer.submit(move || {
            pool.close_resource(id, resource, reason);
            if pool.is_normal() {
                pool.fill_pool();
            }
        });
    }

    fn close_resource(&self, id: u64, resource: ResourceOf<F>, reason: &str) {
        debug!("{} - Closing resource {}: {}", self.name, id, reason);
        self.factory.close(resource);
        self.metrics.record_closed();
    }

    /// Mark for eviction; close now if the caller owns the entry or it can be reserved.
    fn soft_evict(
        self: &Arc<Self>,
        entry: &Arc<PoolEntry<ResourceOf<F>>>,
        reason: &'static str,
        owner: bool,
    ) -> bool {
        entry.mark_evicted();
        if owner || self.bag.reserve(entry) {
            self.close_entry(entry, reason);
            true
        } else {
            false
        }
    }

    fn soft_evict_all(self: &Arc<Self>) {
        for entry in self.bag.values() {
            self.soft_evict(&entry, EVICTED_MESSAGE, false);
        }
    }

    /// Top the pool up towards `min_idle` without exceeding `max_pool_size`.
    fn fill_pool(&self) {
        let _guard = self.fill_lock.lock();
        let total = self.bag.size();
        let idle = self.bag.count(EntryState::Free);
        let need = self
            .config
            .max_pool_size
            .saturating_sub(total)
            .min(self.config.min_idle().saturating_sub(idle))
            .saturating_sub(self.adder.queued());

        for _ in 0..need {
            self.submit_creator();
        }
        if need > 0 {
            self.log_pool_state("Fill pool ");
        }
    }

    fn submit_creator(&self) {
        let pool = self.weak_self.clone();
        self.adder.submit(move || create_with_backoff(&pool));
    }

    fn should_create_another(&self) -> bool {
        self.bag.size() < self.config.max_pool_size
            && (self.bag.waiting() > 0 || self.bag.count(EntryState::Free) < self.config.min_idle())
    }

    fn create_pool_entry(&self) -> Option<Arc<PoolEntry<ResourceOf<F>>>> {
        let started = Instant::now();
        match self.new_resource() {
            Ok(resource) => {
                self.metrics.record_created();
                if let Some(observer) = &self.observer {
                    observer.on_resource_created(started.elapsed());
                }

                let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(PoolEntry::new(id, resource, self.clock.now_millis()));
                self.arm_end_of_life(&entry);
                Some(entry)
            }
            Err(err) => {
                self.metrics.record_creation_failure();
                if self.is_normal() {
                    error!(
                        "{} - Error thrown while acquiring resource from factory: {}",
                        self.name, err
                    );
                    *self.last_failure.lock() = Some(Arc::new(err));
                }
                None
            }
        }
    }

    fn new_resource(&self) -> Result<ResourceOf<F>, ResourceSetupError> {
        let created = catch_unwind(AssertUnwindSafe(|| self.factory.create()))
            .map_err(|_| ResourceSetupError::new("resource factory panicked"))?;
        let mut resource =
            created.map_err(|e| ResourceSetupError::with_source("resource creation failed", e))?;

        if !self
            .factory
            .validate(&mut resource, self.settings.validation_timeout())
        {
            self.factory.close(resource);
            return Err(ResourceSetupError::new(
                "newly created resource failed validation",
            ));
        }
        Ok(resource)
    }

    fn arm_end_of_life(&self, entry: &Arc<PoolEntry<ResourceOf<F>>>) {
        let max_lifetime = self.settings.max_lifetime();
        if max_lifetime.is_zero() {
            return;
        }

        // Stagger retirement so resources created together do not expire together.
        let variance = if max_lifetime > Duration::from_secs(10) {
            let spread = millis(max_lifetime / 40);
            Duration::from_millis(rand::rng().random_range(0..spread))
        } else {
            Duration::ZERO
        };

        let pool = self.weak_self.clone();
        let target = Arc::downgrade(entry);
        entry.set_end_of_life(self.scheduler.schedule(max_lifetime - variance, move || {
            let (Some(pool), Some(entry)) = (pool.upgrade(), target.upgrade()) else {
                return;
            };
            if pool.soft_evict(&entry, "(resource has passed max_lifetime)", false) {
                pool.add_bag_item(pool.bag.waiting());
            }
        }));
    }

    fn check_fail_fast(&self) -> PoolResult<()> {
        let Some(window) = self.config.initialization_fail_timeout else {
            return Ok(());
        };

        let start = Instant::now();
        loop {
            if let Some(entry) = self.create_pool_entry() {
                if self.config.min_idle() > 0 {
                    self.bag.add(Arc::clone(&entry))?;
                    debug!("{} - Added resource {}", self.name, entry.id());
                } else if let Some(resource) = entry.close() {
                    self.close_resource(
                        entry.id(),
                        resource,
                        "(initialization check complete and min_idle is zero)",
                    );
                }
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= window {
                break;
            }
            thread::sleep(INITIALIZATION_RETRY_PAUSE.min(window - elapsed));
        }

        Err(PoolError::Initialization {
            pool: self.name.clone(),
            cause: self.last_failure.lock().clone(),
        })
    }

    fn housekeep(self: &Arc<Self>) {
        self.leak_detector
            .update_threshold(self.settings.leak_detection_threshold());
        let idle_timeout = self.settings.idle_timeout();
        let period = millis(self.config.housekeeping_period);

        let now = self.clock.now_millis();
        let previous = self.housekeeping_previous.load(Ordering::Acquire);

        if now.saturating_add(CLOCK_SLACK_MS) < previous.saturating_add(period) {
            warn!(
                "{} - Retrograde clock change detected (housekeeper delta={}), soft-evicting resources from pool.",
                self.name,
                elapsed_display(previous, now)
            );
            self.housekeeping_previous.store(now, Ordering::Release);
            self.soft_evict_all();
            return;
        } else if now > previous.saturating_add(period.saturating_mul(3) / 2) {
            // Forward jumps only hasten normal retirement.
            warn!(
                "{} - Thread starvation or clock leap detected (housekeeper delta={}).",
                self.name,
                elapsed_display(previous, now)
            );
        }
        self.housekeeping_previous.store(now, Ordering::Release);

        let mut after = "Pool ";
        let min_idle = self.config.min_idle();
        if !idle_timeout.is_zero() && min_idle < self.config.max_pool_size {
            self.log_pool_state("Before cleanup ");
            after = "After cleanup  ";

            let free = self.bag.values_in(EntryState::Free);
            let mut to_remove = free.len().saturating_sub(min_idle);
            for entry in free {
                if to_remove > 0
                    && self.clock.elapsed_since(entry.last_accessed()) > idle_timeout
                    && self.bag.reserve(&entry)
                {
                    self.close_entry(&entry, "(resource has passed idle_timeout)");
                    to_remove -= 1;
                }
            }
        }

        self.log_pool_state(after);
        self.fill_pool();
    }

    fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(POOL_NORMAL, POOL_SHUTDOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("{} - Pool already shut down", self.name);
            return;
        }

        info!("{} - Shutdown initiated...", self.name);
        self.log_pool_state("Before shutdown ");

        if let Some(task) = self.housekeeper.lock().take() {
            task.cancel();
        }

        self.soft_evict_all();
        self.adder.shutdown(ADDER_SHUTDOWN_WAIT);
        self.bag.close();

        let start = Instant::now();
        loop {
            self.abort_active();
            self.soft_evict_all();
            if self.bag.size() == 0 || start.elapsed() >= ABORT_WINDOW {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        self.closer.shutdown(CLOSER_SHUTDOWN_WAIT);
        self.scheduler.shutdown(Duration::from_secs(1));

        self.log_pool_state("After shutdown ");
        info!("{} - Shutdown completed.", self.name);
    }

    /// Take every borrowed entry out of the bag; holders close the resource on return.
    fn abort_active(&self) {
        for entry in self.bag.values_in(EntryState::Using) {
            entry.mark_aborted();
            if self.bag.remove(&entry).is_ok()
                && let Some(resource) = entry.close()
            {
                self.close_resource(entry.id(), resource, ABORTED_MESSAGE);
            }
        }
    }

    fn metrics_snapshot(&self) -> PoolMetrics {
        let counts = self.bag.state_counts();
        self.metrics.snapshot(
            counts.using,
            counts.free,
            self.bag.size(),
            self.bag.waiting(),
            self.config.max_pool_size,
        )
    }

    fn log_pool_state(&self, prefix: &str) {
        let counts = self.bag.state_counts();
        debug!(
            "{} - {}stats (total={}, active={}, idle={}, waiting={})",
            self.name,
            prefix,
            self.bag.size(),
            counts.using,
            counts.free,
            self.bag.waiting()
        );
    }
}

impl<F: ResourceFactory> BagStateListener for PoolInner<F> {
    fn add_bag_item(&self, waiting: usize) {
        if waiting >= self.adder.queued() {
            self.submit_creator();
        }
    }
}

impl<F: ResourceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if self.is_normal() {
            debug!("{} - Pool dropped without shutdown, closing resources", self.name);
            for entry in self.bag.values() {
                if let Some(resource) = entry.close() {
                    self.factory.close(resource);
                }
            }
        }
    }
}

/// Body of a creation task: retry with backoff while growth is still warranted.
fn create_with_backoff<F: ResourceFactory>(pool: &Weak<PoolInner<F>>) {
    let mut backoff = CREATE_BACKOFF_START;
    loop {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if !inner.is_normal() || !inner.should_create_another() {
            return;
        }

        if let Some(entry) = inner.create_pool_entry() {
            match inner.bag.add(Arc::clone(&entry)) {
                Ok(()) => debug!("{} - Added resource {}", inner.name, entry.id()),
                Err(_) => {
                    if let Some(resource) = entry.close() {
                        inner.close_resource(entry.id(), resource, "(pool is shutting down)");
                    }
                }
            }
            return;
        }

        let cap = CREATE_BACKOFF_CAP.min(inner.settings.connection_timeout());
        debug!(
            "{} - Resource add failed, sleeping with backoff: {}ms",
            inner.name,
            backoff.as_millis()
        );
        drop(inner);
        thread::sleep(backoff);
        backoff = cap.min(backoff.mul_f64(1.5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::BoxError;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct TestFactory {
        created: AtomicUsize,
        closed: AtomicUsize,
        validations: AtomicUsize,
        failing: AtomicBool,
        dead: AtomicBool,
        reset_fails: AtomicBool,
        panic_next: AtomicBool,
    }

    impl ResourceFactory for TestFactory {
        type Resource = usize;

        fn create(&self) -> Result<usize, BoxError> {
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("driver crashed while connecting");
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err("backend unreachable".into());
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn validate(&self, _resource: &mut usize, _timeout: Duration) -> bool {
            self.validations.fetch_add(1, Ordering::SeqCst);
            !self.dead.load(Ordering::SeqCst)
        }

        fn close(&self, _resource: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn reset(&self, _resource: &mut usize) -> Result<(), BoxError> {
            if self.reset_fails.load(Ordering::SeqCst) {
                return Err("dirty state".into());
            }
            Ok(())
        }
    }

    fn on_demand_config(max: usize) -> PoolConfiguration {
        PoolConfiguration::new()
            .with_pool_name("test")
            .with_max_pool_size(max)
            .with_min_idle(0)
            .with_connection_timeout(Duration::from_secs(2))
    }

    fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn acquire_and_release() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(2)).unwrap();

        {
            let resource = pool.acquire().unwrap();
            assert_eq!(*resource, 1);
            assert_eq!(pool.active(), 1);
        }
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.idle(), 1);

        let again = pool.acquire().unwrap();
        assert_eq!(*again, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        drop(again);

        let metrics = pool.metrics();
        assert_eq!(metrics.total_acquired, 2);
        assert_eq!(metrics.total_released, 2);
        pool.shutdown();
    }

    #[test]
    fn timeout_carries_last_creation_failure() {
        let factory = Arc::new(TestFactory::default());
        factory.failing.store(true, Ordering::SeqCst);
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(1)).unwrap();

        let err = pool.acquire_timeout(Duration::from_millis(400)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            err.setup_cause().map(|c| c.message()),
            Some("resource creation failed")
        );
        assert_eq!(pool.metrics().timeouts, 1);
        pool.shutdown();
    }

    #[test]
    fn fail_fast_reports_unreachable_backend() {
        let factory = Arc::new(TestFactory::default());
        factory.failing.store(true, Ordering::SeqCst);

        let err = ResourcePool::new(
            Arc::clone(&factory),
            on_demand_config(2).with_fail_fast(Duration::ZERO),
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Initialization { .. }));
        assert!(err.setup_cause().is_some());
    }

    #[test]
    fn fail_fast_success_keeps_first_resource() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(
            Arc::clone(&factory),
            on_demand_config(2)
                .with_min_idle(1)
                .with_fail_fast(Duration::from_secs(1)),
        )
        .unwrap();

        assert!(pool.total() >= 1);
        pool.shutdown();
    }

    #[test]
    fn dead_resource_is_replaced_within_budget() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(
            Arc::clone(&factory),
            on_demand_config(1).with_alive_bypass_window(Duration::ZERO),
        )
        .unwrap();

        drop(pool.acquire().unwrap());
        thread::sleep(Duration::from_millis(20));

        factory.dead.store(true, Ordering::SeqCst);
        // The replacement also fails its creation check while dead; revive it shortly.
        let reviver = {
            let factory = Arc::clone(&factory);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                factory.dead.store(false, Ordering::SeqCst);
            })
        };

        let resource = pool.acquire_timeout(Duration::from_secs(3)).unwrap();
        assert_ne!(*resource, 1);
        assert!(factory.closed.load(Ordering::SeqCst) >= 1);
        reviver.join().unwrap();
        drop(resource);
        pool.shutdown();
    }

    #[test]
    fn recently_used_resource_skips_probe() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(1)).unwrap();

        drop(pool.acquire().unwrap());
        let probes = factory.validations.load(Ordering::SeqCst);
        drop(pool.acquire().unwrap());
        assert_eq!(factory.validations.load(Ordering::SeqCst), probes);
        pool.shutdown();
    }

    #[test]
    fn evict_closes_instead_of_returning() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(2)).unwrap();

        let resource = pool.acquire().unwrap();
        resource.evict();
        assert_eq!(pool.total(), 0);
        assert!(wait_until(Duration::from_secs(2), || {
            factory.closed.load(Ordering::SeqCst) == 1
        }));
        pool.shutdown();
    }

    #[test]
    fn failed_reset_retires_resource() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(2)).unwrap();

        let resource = pool.acquire().unwrap();
        factory.reset_fails.store(true, Ordering::SeqCst);
        drop(resource);

        assert_eq!(pool.total(), 0);
        assert!(wait_until(Duration::from_secs(2), || {
            factory.closed.load(Ordering::SeqCst) == 1
        }));
        pool.shutdown();
    }

    #[test]
    fn max_lifetime_retires_idle_resources() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(
            Arc::clone(&factory),
            on_demand_config(2)
                .with_min_idle(1)
                .with_idle_timeout(Duration::ZERO)
                .with_max_lifetime(Duration::from_millis(200)),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(3), || {
            factory.closed.load(Ordering::SeqCst) >= 1 && pool.total() == 1
        }));
        assert!(factory.created.load(Ordering::SeqCst) >= 2);
        pool.shutdown();
    }

    #[test]
    fn shutdown_twice_closes_each_resource_once() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(3)).unwrap();

        let held = pool.acquire().unwrap();
        drop(pool.acquire().unwrap());
        let other = pool.acquire().unwrap();
        drop(other);

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.total(), 0);

        drop(held);
        let created = factory.created.load(Ordering::SeqCst);
        assert_eq!(factory.closed.load(Ordering::SeqCst), created);
        assert!(matches!(pool.acquire(), Err(PoolError::Closed(_))));
    }

    #[test]
    fn retrograde_clock_evicts_and_forward_leap_only_logs() {
        let factory = Arc::new(TestFactory::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let period = Duration::from_secs(60);
        let pool = ResourcePool::builder(Arc::clone(&factory))
            .config(
                on_demand_config(3)
                    .with_min_idle(3)
                    .with_idle_timeout(Duration::ZERO)
                    .with_max_lifetime(Duration::ZERO)
                    .with_housekeeping_period(period),
            )
            .clock(clock.clone())
            .build()
            .unwrap();

        assert!(wait_until(Duration::from_secs(3), || pool.idle() == 3));
        // Let the first scheduled pass run against the frozen clock.
        thread::sleep(Duration::from_millis(300));
        let inner = &pool.inner;
        assert_eq!(
            inner.housekeeping_previous.load(Ordering::SeqCst),
            clock.now_millis()
        );

        clock.advance(period);
        inner.housekeep();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);

        // Forward leap of twice the period.
        clock.advance(period * 2);
        inner.housekeep();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.total(), 3);

        // Next pass arrives 500ms earlier than the clock says it should.
        clock.advance(period);
        clock.rewind(Duration::from_millis(500));
        inner.housekeep();
        assert!(wait_until(Duration::from_secs(2), || {
            factory.closed.load(Ordering::SeqCst) == 3
        }));
        pool.shutdown();
    }

    #[test]
    fn idle_entries_reaped_down_to_min_idle() {
        let factory = Arc::new(TestFactory::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let period = Duration::from_secs(60);
        let pool = ResourcePool::builder(Arc::clone(&factory))
            .config(
                on_demand_config(4)
                    .with_min_idle(1)
                    .with_idle_timeout(Duration::from_secs(30))
                    .with_max_lifetime(Duration::ZERO)
                    .with_housekeeping_period(period),
            )
            .clock(clock.clone())
            .build()
            .unwrap();

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        drop(held);
        assert_eq!(pool.idle(), 3);
        thread::sleep(Duration::from_millis(300));

        clock.advance(period);
        pool.inner.housekeep();
        assert_eq!(pool.total(), 1);
        pool.shutdown();
    }

    #[test]
    fn evicted_while_borrowed_is_closed_on_return() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(2)).unwrap();

        let resource = pool.acquire().unwrap();
        pool.soft_evict_all();
        assert_eq!(pool.total(), 1);

        drop(resource);
        assert_eq!(pool.total(), 0);
        assert!(wait_until(Duration::from_secs(2), || {
            factory.closed.load(Ordering::SeqCst) == 1
        }));
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_async_returns_resource() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(2)).unwrap();

        let resource = pool.acquire_async().await.unwrap();
        assert_eq!(*resource, 1);
        drop(resource);

        let closer = pool.clone();
        tokio::task::spawn_blocking(move || closer.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn panicking_factory_is_retried_like_a_failed_create() {
        let factory = Arc::new(TestFactory::default());
        factory.panic_next.store(true, Ordering::SeqCst);
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(2)).unwrap();

        let first = pool.acquire_timeout(Duration::from_millis(500));
        drop(first);
        let second = pool.acquire_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(*second, 1);
        assert_eq!(pool.metrics().creation_failures, 1);

        drop(second);
        pool.shutdown();
    }

    #[test]
    fn unbounded_acquire_waits_for_release() {
        let factory = Arc::new(TestFactory::default());
        let pool = ResourcePool::new(Arc::clone(&factory), on_demand_config(1)).unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire_timeout(Duration::MAX).map(|resource| *resource))
        };
        thread::sleep(Duration::from_millis(100));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 1);
        pool.shutdown();
    }
}
