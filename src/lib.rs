//! # Esox ConnPool
//!
//! A fast, bounded pool for long-lived resources such as database
//! connections, with background creation, retirement and leak detection.
//!
//! ## Features
//!
//! - Lock-free borrow path with per-thread affinity and direct hand-off to waiters
//! - Automatic return of resources via RAII (Drop trait)
//! - Background growth towards `min_idle`, never beyond `max_pool_size`
//! - Liveness probing of stale resources before hand-out
//! - Idle timeout and staggered max lifetime retirement
//! - Leak detection with recovery reporting
//! - Clock-jump detection in housekeeping
//! - Async acquisition on top of the blocking pool
//! - Metrics, Prometheus export and health reporting
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connpool::{BoxError, PoolConfiguration, ResourceFactory, ResourcePool};
//! use std::time::Duration;
//!
//! struct Sessions;
//!
//! impl ResourceFactory for Sessions {
//!     type Resource = String;
//!
//!     fn create(&self) -> Result<String, BoxError> {
//!         Ok("session".to_string())
//!     }
//!
//!     fn validate(&self, _session: &mut String, _timeout: Duration) -> bool {
//!         true
//!     }
//! }
//!
//! let pool = ResourcePool::new(Sessions, PoolConfiguration::new().with_max_pool_size(4)).unwrap();
//! {
//!     let session = pool.acquire().unwrap();
//!     println!("Got: {}", *session);
//!     // Resource automatically returned when `session` goes out of scope
//! }
//! pool.shutdown();
//! ```

mod bag;
mod clock;
mod config;
mod entry;
mod errors;
mod executor;
mod factory;
mod health;
mod leak;
mod metrics;
mod pool;
mod scheduler;

pub use bag::{BagEntry, BagStateListener, EntryState, ResourceBag, StateCounts};
pub use clock::{Clock, ManualClock, MonotonicClock, elapsed_display};
pub use config::{PoolConfiguration, PoolNameSequence, PoolSettings};
pub use errors::{BoxError, PoolError, PoolResult, ResourceSetupError};
pub use factory::{Observer, ResourceFactory};
pub use health::HealthStatus;
#[cfg(feature = "metrics")]
pub use metrics::PrometheusObserver;
pub use metrics::{MetricsExporter, PoolMetrics};
pub use pool::{PoolBuilder, PooledResource, ResourcePool};
