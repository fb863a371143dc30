//! Health reporting for resource pools

use crate::metrics::PoolMetrics;

/// Health status of a resource pool
///
/// # Examples
///
/// ```
/// use esox_connpool::{HealthStatus, PoolMetrics};
///
/// let metrics = PoolMetrics {
///     idle_resources: 3,
///     total_resources: 3,
///     max_pool_size: 10,
///     ..Default::default()
/// };
///
/// let health = HealthStatus::from_metrics(&metrics);
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_resources, 3);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    pub idle_resources: usize,

    pub active_resources: usize,

    pub waiting_callers: usize,

    /// Configured maximum pool size
    pub total_capacity: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Derive a health status from a metrics snapshot
    pub fn from_metrics(metrics: &PoolMetrics) -> Self {
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if metrics.utilization > 0.9 {
            warnings.push(format!(
                "High utilization: {:.1}%",
                metrics.utilization * 100.0
            ));
            is_healthy = false;
        }

        if metrics.waiting_callers > 0 && metrics.idle_resources == 0 {
            warnings.push(format!(
                "{} caller(s) waiting with no idle resources",
                metrics.waiting_callers
            ));
            is_healthy = false;
        }

        let outstanding = metrics.leaks_detected.saturating_sub(metrics.leaks_recovered);
        if outstanding > 0 {
            warnings.push(format!("{outstanding} resource(s) suspected leaked"));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization: metrics.utilization,
            idle_resources: metrics.idle_resources,
            active_resources: metrics.active_resources,
            waiting_callers: metrics.waiting_callers,
            total_capacity: metrics.max_pool_size,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_pool_is_unhealthy() {
        let metrics = PoolMetrics {
            active_resources: 10,
            total_resources: 10,
            waiting_callers: 2,
            max_pool_size: 10,
            utilization: 1.0,
            ..Default::default()
        };

        let health = HealthStatus::from_metrics(&metrics);
        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 2);
    }

    #[test]
    fn outstanding_leak_warns_without_failing() {
        let metrics = PoolMetrics {
            active_resources: 1,
            total_resources: 2,
            idle_resources: 1,
            max_pool_size: 10,
            leaks_detected: 2,
            leaks_recovered: 1,
            utilization: 0.1,
            ..Default::default()
        };

        let health = HealthStatus::from_metrics(&metrics);
        assert!(health.is_healthy());
        assert_eq!(health.warnings, vec!["1 resource(s) suspected leaked".to_string()]);
    }
}
