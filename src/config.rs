//! Pool configuration options

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::errors::{PoolError, PoolResult};

const SOFT_TIMEOUT_FLOOR: Duration = Duration::from_millis(250);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(1800);
const DEFAULT_HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_ALIVE_BYPASS_WINDOW: Duration = Duration::from_millis(500);
const DEFAULT_POOL_SIZE: usize = 10;

/// Configuration for a resource pool
///
/// Sizes are fixed once the pool starts; timeouts can later be changed
/// through [`PoolSettings`].
///
/// # Examples
///
/// ```
/// use esox_connpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_pool_name("orders-db")
///     .with_max_pool_size(20)
///     .with_min_idle(5)
///     .with_connection_timeout(Duration::from_secs(5))
///     .with_idle_timeout(Duration::from_secs(300));
///
/// assert_eq!(config.max_pool_size, 20);
/// assert_eq!(config.min_idle, Some(5));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Name used as the prefix of every log line and metric label
    pub pool_name: String,

    /// Maximum number of resources, idle and in use combined
    pub max_pool_size: usize,

    /// Idle resources the pool tries to keep; defaults to `max_pool_size`
    pub min_idle: Option<usize>,

    /// How long `acquire` waits before failing
    pub connection_timeout: Duration,

    /// How long a liveness probe may take
    pub validation_timeout: Duration,

    /// Idle resources beyond `min_idle` are closed after this long; zero disables
    pub idle_timeout: Duration,

    /// Resources are retired after this long; zero disables
    pub max_lifetime: Duration,

    /// Borrowed resources held longer than this are reported; zero disables
    pub leak_detection_threshold: Duration,

    /// Interval between housekeeping passes
    pub housekeeping_period: Duration,

    /// Resources used more recently than this skip the liveness probe
    pub alive_bypass_window: Duration,

    /// Fail-fast start-up window; `None` skips the start-up check
    pub initialization_fail_timeout: Option<Duration>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            pool_name: "ResourcePool".to_string(),
            max_pool_size: DEFAULT_POOL_SIZE,
            min_idle: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            leak_detection_threshold: Duration::ZERO,
            housekeeping_period: DEFAULT_HOUSEKEEPING_PERIOD,
            alive_bypass_window: DEFAULT_ALIVE_BYPASS_WINDOW,
            initialization_fail_timeout: None,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_max_pool_size(50);
    ///
    /// assert_eq!(config.max_pool_size, 50);
    /// ```
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.min_idle = Some(count);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_leak_detection_threshold(mut self, threshold: Duration) -> Self {
        self.leak_detection_threshold = threshold;
        self
    }

    pub fn with_housekeeping_period(mut self, period: Duration) -> Self {
        self.housekeeping_period = period;
        self
    }

    pub fn with_alive_bypass_window(mut self, window: Duration) -> Self {
        self.alive_bypass_window = window;
        self
    }

    /// Enable fail-fast start-up
    ///
    /// The pool keeps trying to create its first resource for `window`
    /// before giving up; `Duration::ZERO` makes exactly one attempt.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new().with_fail_fast(Duration::ZERO);
    ///
    /// assert_eq!(config.initialization_fail_timeout, Some(Duration::ZERO));
    /// ```
    pub fn with_fail_fast(mut self, window: Duration) -> Self {
        self.initialization_fail_timeout = Some(window);
        self
    }

    /// Effective minimum idle count
    pub fn min_idle(&self) -> usize {
        self.min_idle.unwrap_or(self.max_pool_size)
    }

    /// Check the configuration, correcting soft problems and rejecting hard ones.
    pub fn validate(mut self) -> PoolResult<Self> {
        let name = self.pool_name.clone();

        if self.max_pool_size == 0 {
            return Err(PoolError::Configuration(format!(
                "{name} - max_pool_size must be at least 1"
            )));
        }
        if self.housekeeping_period.is_zero() {
            return Err(PoolError::Configuration(format!(
                "{name} - housekeeping_period must be greater than zero"
            )));
        }

        if let Some(min_idle) = self.min_idle
            && min_idle > self.max_pool_size
        {
            warn!(
                "{} - min_idle {} exceeds max_pool_size, using {}",
                name, min_idle, self.max_pool_size
            );
            self.min_idle = Some(self.max_pool_size);
        }

        self.connection_timeout = floor_connection_timeout(&name, self.connection_timeout);
        self.validation_timeout = floor_validation_timeout(&name, self.validation_timeout);
        if self.validation_timeout > self.connection_timeout {
            warn!(
                "{} - validation_timeout is more than connection_timeout, using {}ms",
                name,
                self.connection_timeout.as_millis()
            );
            self.validation_timeout = self.connection_timeout;
        }

        if !self.max_lifetime.is_zero()
            && !self.idle_timeout.is_zero()
            && self.idle_timeout + Duration::from_secs(1) > self.max_lifetime
        {
            warn!(
                "{} - idle_timeout is close to or more than max_lifetime, disabling it",
                name
            );
            self.idle_timeout = Duration::ZERO;
        }

        if !self.leak_detection_threshold.is_zero()
            && !self.max_lifetime.is_zero()
            && self.leak_detection_threshold > self.max_lifetime
        {
            warn!(
                "{} - leak_detection_threshold is more than max_lifetime, disabling it",
                name
            );
            self.leak_detection_threshold = Duration::ZERO;
        }

        Ok(self)
    }
}

fn floor_connection_timeout(name: &str, timeout: Duration) -> Duration {
    if timeout < SOFT_TIMEOUT_FLOOR {
        warn!(
            "{} - connection_timeout is less than {}ms, setting to {}ms",
            name,
            SOFT_TIMEOUT_FLOOR.as_millis(),
            DEFAULT_CONNECTION_TIMEOUT.as_millis()
        );
        DEFAULT_CONNECTION_TIMEOUT
    } else {
        timeout
    }
}

fn floor_validation_timeout(name: &str, timeout: Duration) -> Duration {
    if timeout < SOFT_TIMEOUT_FLOOR {
        warn!(
            "{} - validation_timeout is less than {}ms, setting to {}ms",
            name,
            SOFT_TIMEOUT_FLOOR.as_millis(),
            DEFAULT_VALIDATION_TIMEOUT.as_millis()
        );
        DEFAULT_VALIDATION_TIMEOUT
    } else {
        timeout
    }
}

/// The runtime-mutable part of a pool's configuration
///
/// Changes to the connection timeout apply to the next `acquire`; the others
/// are picked up at the next housekeeping pass or the next resource created.
#[derive(Debug)]
pub struct PoolSettings {
    pool_name: String,
    connection_timeout_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    max_lifetime_ms: AtomicU64,
    leak_detection_threshold_ms: AtomicU64,
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PoolSettings {
    pub(crate) fn from_config(config: &PoolConfiguration) -> Self {
        Self {
            pool_name: config.pool_name.clone(),
            connection_timeout_ms: AtomicU64::new(millis(config.connection_timeout)),
            validation_timeout_ms: AtomicU64::new(millis(config.validation_timeout)),
            idle_timeout_ms: AtomicU64::new(millis(config.idle_timeout)),
            max_lifetime_ms: AtomicU64::new(millis(config.max_lifetime)),
            leak_detection_threshold_ms: AtomicU64::new(millis(config.leak_detection_threshold)),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        let timeout = floor_connection_timeout(&self.pool_name, timeout);
        self.connection_timeout_ms
            .store(millis(timeout), Ordering::Release);
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_validation_timeout(&self, timeout: Duration) {
        let timeout = floor_validation_timeout(&self.pool_name, timeout);
        self.validation_timeout_ms
            .store(millis(timeout), Ordering::Release);
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms.store(millis(timeout), Ordering::Release);
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms.load(Ordering::Acquire))
    }

    pub fn set_max_lifetime(&self, lifetime: Duration) {
        self.max_lifetime_ms.store(millis(lifetime), Ordering::Release);
    }

    pub fn leak_detection_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_detection_threshold_ms.load(Ordering::Acquire))
    }

    pub fn set_leak_detection_threshold(&self, threshold: Duration) {
        self.leak_detection_threshold_ms
            .store(millis(threshold), Ordering::Release);
    }
}

/// Hands out unique pool names from an owned counter
///
/// # Examples
///
/// ```
/// use esox_connpool::PoolNameSequence;
///
/// let names = PoolNameSequence::new("ResourcePool");
/// assert_eq!(names.next_name(), "ResourcePool-1");
/// assert_eq!(names.next_name(), "ResourcePool-2");
/// ```
#[derive(Debug)]
pub struct PoolNameSequence {
    prefix: String,
    next: AtomicU64,
}

impl PoolNameSequence {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_name(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
