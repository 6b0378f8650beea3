use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Operations that reached a terminal state.
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub lock_acquisitions: u64,
    /// Locks force-released by housekeeping.
    pub lock_timeouts: u64,
    /// Lock contention seen in the in-process registry.
    pub lock_conflicts: u64,
    /// Conditional writes rejected by the store.
    pub version_conflicts: u64,
    pub retries: u64,
    pub merges: u64,
    pub overrides: u64,
    /// Mean wall-clock time from start to terminal state.
    pub average_operation_ms: f64,
    /// Mean time a lock was held.
    pub average_lock_ms: f64,
    pub throughput_per_sec: f64,
    pub started_at: DateTime<Utc>,
}

impl Metrics {
    fn new() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            lock_acquisitions: 0,
            lock_timeouts: 0,
            lock_conflicts: 0,
            version_conflicts: 0,
            retries: 0,
            merges: 0,
            overrides: 0,
            average_operation_ms: 0.0,
            average_lock_ms: 0.0,
            throughput_per_sec: 0.0,
            started_at: Utc::now(),
        }
    }

    /// Share of terminal operations that completed.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations > 0 {
            self.successful_operations as f64 / self.total_operations as f64
        } else {
            0.0
        }
    }
}

/// Aggregates engine statistics behind a single mutex.
pub struct MetricsCollector {
    inner: Mutex<Metrics>,
    lock_releases: Mutex<u64>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::new()),
            lock_releases: Mutex::new(0),
        }
    }

    /// Records a terminal operation and folds its latency into the mean.
    pub fn record_operation(&self, succeeded: bool, elapsed: Duration) {
        let mut m = self.inner.lock();
        m.total_operations += 1;
        if succeeded {
            m.successful_operations += 1;
        } else {
            m.failed_operations += 1;
        }
        let n = m.total_operations as f64;
        m.average_operation_ms += (millis(elapsed) - m.average_operation_ms) / n;
    }

    pub fn record_lock_acquired(&self) {
        self.inner.lock().lock_acquisitions += 1;
    }

    pub fn record_lock_released(&self, held_for: Duration) {
        let mut releases = self.lock_releases.lock();
        *releases += 1;
        let n = *releases as f64;
        let mut m = self.inner.lock();
        m.average_lock_ms += (millis(held_for) - m.average_lock_ms) / n;
    }

    pub fn record_lock_conflict(&self) {
        self.inner.lock().lock_conflicts += 1;
    }

    pub fn record_version_conflict(&self) {
        self.inner.lock().version_conflicts += 1;
    }

    pub fn record_lock_timeout(&self) {
        self.inner.lock().lock_timeouts += 1;
    }

    pub fn record_retry(&self) {
        self.inner.lock().retries += 1;
    }

    pub fn record_merge(&self) {
        self.inner.lock().merges += 1;
    }

    pub fn record_override(&self) {
        self.inner.lock().overrides += 1;
    }

    /// Recomputes `throughput_per_sec` as terminal operations over uptime.
    pub fn refresh_throughput(&self) -> f64 {
        let mut m = self.inner.lock();
        let elapsed = (Utc::now() - m.started_at).num_milliseconds() as f64 / 1000.0;
        m.throughput_per_sec = if elapsed > 0.0 {
            m.total_operations as f64 / elapsed
        } else {
            0.0
        };
        m.throughput_per_sec
    }

    pub fn snapshot(&self) -> Metrics {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock_releases.lock() = 0;
        *self.inner.lock() = Metrics::new();
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Overall engine health, from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Limits used to derive a [`HealthStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub warning_latency_ms: f64,
    pub critical_latency_ms: f64,
    pub degraded_conflicts: usize,
    pub critical_lock_timeouts: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_latency_ms: 1000.0,
            critical_latency_ms: 5000.0,
            degraded_conflicts: 10,
            critical_lock_timeouts: 5,
        }
    }
}

impl HealthThresholds {
    pub fn assess(&self, stats: &Metrics, unresolved_conflicts: usize) -> HealthStatus {
        if stats.lock_timeouts >= self.critical_lock_timeouts
            || stats.average_operation_ms >= self.critical_latency_ms
        {
            HealthStatus::Critical
        } else if unresolved_conflicts >= self.degraded_conflicts || stats.lock_timeouts > 0 {
            HealthStatus::Degraded
        } else if unresolved_conflicts > 0 || stats.average_operation_ms >= self.warning_latency_ms
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Result of [`Engine::health_check`](crate::engine::Engine::health_check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub unresolved_conflicts: usize,
    pub stats: Metrics,
}
