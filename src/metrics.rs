//! Metrics collection and export for resource pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "metrics")]
use serde::Serialize;

/// Point-in-time metrics for a pool
///
/// # Examples
///
/// ```
/// use esox_connpool::PoolMetrics;
///
/// let metrics = PoolMetrics::default();
/// let exported = metrics.export();
/// assert_eq!(exported["total_resources"], "0");
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "metrics", derive(Serialize))]
pub struct PoolMetrics {
    /// Resources currently checked out
    pub active_resources: usize,

    /// Resources sitting free in the pool
    pub idle_resources: usize,

    /// Every resource the pool holds, in any state
    pub total_resources: usize,

    /// Callers blocked in `acquire`
    pub waiting_callers: usize,

    /// Configured maximum pool size
    pub max_pool_size: usize,

    /// Successful acquisitions
    pub total_acquired: usize,

    /// Resources returned by callers
    pub total_released: usize,

    /// Acquisitions that ran out of time
    pub timeouts: usize,

    /// Resources created
    pub resources_created: usize,

    /// Resources closed
    pub resources_closed: usize,

    /// Failed creation attempts
    pub creation_failures: usize,

    /// Leak warnings issued
    pub leaks_detected: usize,

    /// Leaked resources later returned
    pub leaks_recovered: usize,

    /// Active resources as a share of the maximum (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("active_resources".to_string(), self.active_resources.to_string());
        metrics.insert("idle_resources".to_string(), self.idle_resources.to_string());
        metrics.insert("total_resources".to_string(), self.total_resources.to_string());
        metrics.insert("waiting_callers".to_string(), self.waiting_callers.to_string());
        metrics.insert("max_pool_size".to_string(), self.max_pool_size.to_string());
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("timeouts".to_string(), self.timeouts.to_string());
        metrics.insert("resources_created".to_string(), self.resources_created.to_string());
        metrics.insert("resources_closed".to_string(), self.resources_closed.to_string());
        metrics.insert("creation_failures".to_string(), self.creation_failures.to_string());
        metrics.insert("leaks_detected".to_string(), self.leaks_detected.to_string());
        metrics.insert("leaks_recovered".to_string(), self.leaks_recovered.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }
}

/// Metrics exporter for Prometheus text format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::{MetricsExporter, PoolMetrics};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&PoolMetrics::default(), "db", Some(&tags));
    /// assert!(output.contains("connpool_resources_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges: [(&str, &str, String); 5] = [
            ("connpool_resources_active", "Resources currently checked out", metrics.active_resources.to_string()),
            ("connpool_resources_idle", "Resources idle in the pool", metrics.idle_resources.to_string()),
            ("connpool_resources_total", "Resources held by the pool", metrics.total_resources.to_string()),
            ("connpool_callers_waiting", "Callers waiting for a resource", metrics.waiting_callers.to_string()),
            ("connpool_utilization", "Pool utilization ratio", format!("{:.2}", metrics.utilization)),
        ];
        for (name, help, value) in gauges {
            Self::push_metric(&mut output, name, help, "gauge", &labels, &value);
        }

        let counters: [(&str, &str, usize); 8] = [
            ("connpool_acquired_total", "Successful acquisitions", metrics.total_acquired),
            ("connpool_released_total", "Resources returned by callers", metrics.total_released),
            ("connpool_timeouts_total", "Acquisitions that timed out", metrics.timeouts),
            ("connpool_created_total", "Resources created", metrics.resources_created),
            ("connpool_closed_total", "Resources closed", metrics.resources_closed),
            ("connpool_creation_failures_total", "Failed creation attempts", metrics.creation_failures),
            ("connpool_leaks_detected_total", "Leak warnings issued", metrics.leaks_detected),
            ("connpool_leaks_recovered_total", "Leaked resources returned", metrics.leaks_recovered),
        ];
        for (name, help, value) in counters {
            Self::push_metric(&mut output, name, help, "counter", &labels, &value.to_string());
        }

        output
    }

    fn push_metric(output: &mut String, name: &str, help: &str, kind: &str, labels: &str, value: &str) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut sorted: Vec<_> = tags.iter().collect();
            sorted.sort();
            for (key, value) in sorted {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal event counters
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    acquired: AtomicUsize,
    released: AtomicUsize,
    timeouts: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    creation_failures: AtomicUsize,
    leaks_detected: AtomicUsize,
    leaks_recovered: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leak_detected(&self) {
        self.leaks_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leak_recovered(&self) {
        self.leaks_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leaks_detected(&self) -> usize {
        self.leaks_detected.load(Ordering::Relaxed)
    }

    pub fn leaks_recovered(&self) -> usize {
        self.leaks_recovered.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        active: usize,
        idle: usize,
        total: usize,
        waiting: usize,
        max_pool_size: usize,
    ) -> PoolMetrics {
        let utilization = if max_pool_size > 0 {
            active as f64 / max_pool_size as f64
        } else {
            0.0
        };

        PoolMetrics {
            active_resources: active,
            idle_resources: idle,
            total_resources: total,
            waiting_callers: waiting,
            max_pool_size,
            total_acquired: self.acquired.load(Ordering::Relaxed),
            total_released: self.released.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            resources_created: self.created.load(Ordering::Relaxed),
            resources_closed: self.closed.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            leaks_detected: self.leaks_detected(),
            leaks_recovered: self.leaks_recovered(),
            utilization,
        }
    }
}

#[cfg(feature = "metrics")]
pub use prometheus_observer::PrometheusObserver;

#[cfg(feature = "metrics")]
mod prometheus_observer {
    use std::time::Duration;

    use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

    use crate::factory::Observer;

    /// [`Observer`] that records pool timings into a Prometheus registry.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::{Observer, PrometheusObserver};
    /// use std::time::Duration;
    ///
    /// let observer = PrometheusObserver::new("db").unwrap();
    /// observer.on_timeout();
    /// observer.on_acquire_wait(Duration::from_micros(250));
    ///
    /// let text = observer.render();
    /// assert!(text.contains("connpool_acquire_timeouts_total"));
    /// ```
    pub struct PrometheusObserver {
        registry: Registry,
        creation_seconds: Histogram,
        acquire_wait_seconds: Histogram,
        usage_seconds: Histogram,
        timeouts: IntCounter,
    }

    impl PrometheusObserver {
        pub fn new(pool_name: &str) -> prometheus::Result<Self> {
            let registry = Registry::new();

            let creation_seconds = Histogram::with_opts(
                HistogramOpts::new("connpool_creation_seconds", "Time spent creating resources")
                    .const_label("pool", pool_name),
            )?;
            let acquire_wait_seconds = Histogram::with_opts(
                HistogramOpts::new("connpool_acquire_wait_seconds", "Time callers waited in acquire")
                    .const_label("pool", pool_name),
            )?;
            let usage_seconds = Histogram::with_opts(
                HistogramOpts::new("connpool_usage_seconds", "Time resources were held by callers")
                    .const_label("pool", pool_name),
            )?;
            let timeouts = IntCounter::with_opts(
                Opts::new("connpool_acquire_timeouts_total", "Acquisitions that timed out")
                    .const_label("pool", pool_name),
            )?;

            registry.register(Box::new(creation_seconds.clone()))?;
            registry.register(Box::new(acquire_wait_seconds.clone()))?;
            registry.register(Box::new(usage_seconds.clone()))?;
            registry.register(Box::new(timeouts.clone()))?;

            Ok(Self {
                registry,
                creation_seconds,
                acquire_wait_seconds,
                usage_seconds,
                timeouts,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// Render the registry in Prometheus text format.
        pub fn render(&self) -> String {
            let mut buffer = Vec::new();
            if TextEncoder::new()
                .encode(&self.registry.gather(), &mut buffer)
                .is_err()
            {
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }

    impl Observer for PrometheusObserver {
        fn on_resource_created(&self, elapsed: Duration) {
            self.creation_seconds.observe(elapsed.as_secs_f64());
        }

        fn on_acquire_wait(&self, waited: Duration) {
            self.acquire_wait_seconds.observe(waited.as_secs_f64());
        }

        fn on_usage(&self, held: Duration) {
            self.usage_seconds.observe(held.as_secs_f64());
        }

        fn on_timeout(&self) {
            self.timeouts.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_utilization() {
        let tracker = MetricsTracker::new();
        tracker.record_acquired();
        tracker.record_acquired();
        tracker.record_released();
        tracker.record_timeout();

        let metrics = tracker.snapshot(2, 3, 5, 1, 10);
        assert_eq!(metrics.total_acquired, 2);
        assert_eq!(metrics.total_released, 1);
        assert_eq!(metrics.timeouts, 1);
        assert!((metrics.utilization - 0.2).abs() < f64::EPSILON);
        assert_eq!(metrics.export()["waiting_callers"], "1");
    }

    #[test]
    fn prometheus_text_has_labels_and_types() {
        let metrics = MetricsTracker::new().snapshot(1, 1, 2, 0, 4);
        let output = MetricsExporter::export_prometheus(&metrics, "db", None);
        assert!(output.contains("# TYPE connpool_resources_active gauge"));
        assert!(output.contains("connpool_resources_total{pool=\"db\"} 2"));
        assert!(output.contains("# TYPE connpool_timeouts_total counter"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn prometheus_observer_records_events() {
        use crate::factory::Observer;
        use std::time::Duration;

        let observer = PrometheusObserver::new("db").unwrap();
        observer.on_resource_created(Duration::from_millis(12));
        observer.on_usage(Duration::from_millis(3));
        observer.on_timeout();

        let text = observer.render();
        assert!(text.contains("connpool_creation_seconds_count{pool=\"db\"} 1"));
        assert!(text.contains("connpool_acquire_timeouts_total{pool=\"db\"} 1"));
        assert_eq!(observer.registry().gather().len(), 4);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn metrics_snapshot_serializes() {
        fn assert_serialize<T: Serialize>(_: &T) {}
        assert_serialize(&PoolMetrics::default());
    }
}
