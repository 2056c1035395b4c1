//! Prometheus metrics for gateway observability

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::policy::evaluator::SnapshotStats;

/// Gateway counters and latency percentiles
#[derive(Debug, Clone, Default)]
pub struct GatewayMetrics {
    /// Total number of checks
    pub total_requests: u64,

    /// Checks ending in ACCEPT
    pub accepted: u64,

    /// Checks ending in REJECT by policy
    pub rejected: u64,

    /// Requests rejected while resolving identity
    pub identity_failures: u64,

    /// Cache or store faults
    pub internal_errors: u64,

    /// Evaluator snapshot hits/misses (cumulative)
    pub snapshot_hits: u64,
    pub snapshot_misses: u64,

    /// Latency percentiles
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,

    pub avg_latency_ms: f64,
}

impl GatewayMetrics {
    pub fn snapshot_hit_rate(&self) -> f64 {
        let total = self.snapshot_hits + self.snapshot_misses;
        if total == 0 {
            0.0
        } else {
            self.snapshot_hits as f64 / total as f64
        }
    }

    pub fn accept_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.accepted as f64 / total as f64
        }
    }
}

/// Metrics collector with Prometheus-compatible export
pub struct MetricsCollector {
    metrics: Arc<RwLock<GatewayMetrics>>,

    /// Recent latency samples for percentile calculation
    latency_samples: Arc<RwLock<Vec<f64>>>,

    max_samples: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(max_samples))),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a completed policy decision
    pub async fn record_decision(&self, accepted: bool) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        if accepted {
            metrics.accepted += 1;
        } else {
            metrics.rejected += 1;
        }
    }

    /// Record a check that failed before a decision was reached
    pub async fn record_failure(&self, kind: ErrorKind) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        match kind {
            ErrorKind::Internal => metrics.internal_errors += 1,
            ErrorKind::BadRequest | ErrorKind::Unauthorized => metrics.identity_failures += 1,
        }
    }

    /// Mirror the evaluator's snapshot counters
    pub async fn record_snapshot_stats(&self, stats: SnapshotStats) {
        let mut metrics = self.metrics.write().await;
        metrics.snapshot_hits = stats.hits;
        metrics.snapshot_misses = stats.misses;
    }

    pub async fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut samples = self.latency_samples.write().await;
        samples.push(latency_ms);
        if samples.len() > self.max_samples {
            let excess = samples.len() - self.max_samples;
            samples.drain(0..excess);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut metrics = self.metrics.write().await;
        metrics.avg_latency_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        metrics.latency_p50_ms = Self::percentile(&sorted, 0.50);
        metrics.latency_p90_ms = Self::percentile(&sorted, 0.90);
        metrics.latency_p99_ms = Self::percentile(&sorted, 0.99);
    }

    pub async fn get_metrics(&self) -> GatewayMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = GatewayMetrics::default();
        self.latency_samples.write().await.clear();
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.metrics.read().await;

        format!(
            r#"# HELP tollgate_requests_total Total number of gateway checks
# TYPE tollgate_requests_total counter
tollgate_requests_total {}

# HELP tollgate_accepted_total Checks accepted
# TYPE tollgate_accepted_total counter
tollgate_accepted_total {}

# HELP tollgate_rejected_total Checks rejected by policy
# TYPE tollgate_rejected_total counter
tollgate_rejected_total {}

# HELP tollgate_identity_failures_total Requests rejected during identity resolution
# TYPE tollgate_identity_failures_total counter
tollgate_identity_failures_total {}

# HELP tollgate_internal_errors_total Policy cache faults
# TYPE tollgate_internal_errors_total counter
tollgate_internal_errors_total {}

# HELP tollgate_snapshot_hits_total Evaluator snapshot cache hits
# TYPE tollgate_snapshot_hits_total counter
tollgate_snapshot_hits_total {}

# HELP tollgate_snapshot_misses_total Evaluator snapshot cache misses
# TYPE tollgate_snapshot_misses_total counter
tollgate_snapshot_misses_total {}

# HELP tollgate_latency_seconds Check latency percentiles
# TYPE tollgate_latency_seconds summary
tollgate_latency_seconds{{quantile="0.5"}} {}
tollgate_latency_seconds{{quantile="0.9"}} {}
tollgate_latency_seconds{{quantile="0.99"}} {}
"#,
            metrics.total_requests,
            metrics.accepted,
            metrics.rejected,
            metrics.identity_failures,
            metrics.internal_errors,
            metrics.snapshot_hits,
            metrics.snapshot_misses,
            metrics.latency_p50_ms / 1000.0,
            metrics.latency_p90_ms / 1000.0,
            metrics.latency_p99_ms / 1000.0,
        )
    }

    /// Percentile from sorted data
    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((sorted.len() as f64) * p) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_decisions_and_failures() {
        let collector = MetricsCollector::new();

        collector.record_decision(true).await;
        collector.record_decision(false).await;
        collector.record_decision(true).await;
        collector.record_failure(ErrorKind::Unauthorized).await;
        collector.record_failure(ErrorKind::Internal).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 5);
        assert_eq!(metrics.accepted, 2);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.identity_failures, 1);
        assert_eq!(metrics.internal_errors, 1);
        assert!((metrics.accept_rate() - 0.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_snapshot_stats() {
        let collector = MetricsCollector::new();
        collector
            .record_snapshot_stats(SnapshotStats {
                hits: 3,
                misses: 1,
                entries: 2,
            })
            .await;

        let metrics = collector.get_metrics().await;
        assert!((metrics.snapshot_hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_record_latency() {
        let collector = MetricsCollector::with_capacity(2);

        collector.record_latency(Duration::from_millis(100)).await;
        collector.record_latency(Duration::from_millis(5)).await;
        collector.record_latency(Duration::from_millis(15)).await;

        // oldest sample evicted
        let metrics = collector.get_metrics().await;
        assert!((metrics.avg_latency_ms - 10.0).abs() < 1.0);
        assert!(metrics.latency_p99_ms > 0.0);
    }

    #[tokio::test]
    async fn test_prometheus_export_and_reset() {
        let collector = MetricsCollector::new();
        collector.record_decision(true).await;

        let prometheus = collector.export_prometheus().await;
        assert!(prometheus.contains("tollgate_requests_total 1"));
        assert!(prometheus.contains("tollgate_accepted_total 1"));

        collector.reset().await;
        assert_eq!(collector.get_metrics().await.total_requests, 0);
    }
}
