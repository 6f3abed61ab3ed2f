//! Prometheus export of arbiter state

use crate::arbiter::ArbiterSnapshot;
use crate::types::AdmissionState;
use crate::{ArbiterError, Result};

use prometheus::core::Collector;
use prometheus::{Encoder, GaugeVec, Registry, TextEncoder};

/// Per-resource arbiter gauges
#[derive(Debug, Clone)]
pub struct ArbiterPrometheusMetrics {
    /// Leases granted
    pub acquired_total: GaugeVec,

    /// Requests skipped after their wait budget
    pub skipped_total: GaugeVec,

    /// Requests sent to CPU after their wait budget
    pub fallback_cpu_total: GaugeVec,

    /// Queue deadlines that fired
    pub timeouts_total: GaugeVec,

    /// Admissions while the queue was at its limit
    pub queue_full_total: GaugeVec,

    /// Leases held past their hold_max
    pub watchdog_violations_total: GaugeVec,

    pub queue_depth: GaugeVec,

    /// Admission state (1 = high pressure, 0 = normal)
    pub high_pressure: GaugeVec,

    /// Cached GPU usage, absent while stale
    pub gpu_usage_percent: GaugeVec,

    /// Whether a lease is held (1 = held, 0 = free)
    pub lease_held: GaugeVec,

    pub avg_queue_wait_ms: GaugeVec,

    pub avg_hold_ms: GaugeVec,
}

fn gauge(name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(prometheus::Opts::new(name, help), &["resource_key"])
}

impl ArbiterPrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            acquired_total: gauge("gpu_arbiter_acquired_total", "Leases granted")?,
            skipped_total: gauge("gpu_arbiter_skipped_total", "Requests skipped after waiting")?,
            fallback_cpu_total: gauge(
                "gpu_arbiter_fallback_cpu_total",
                "Requests redirected to CPU after waiting",
            )?,
            timeouts_total: gauge("gpu_arbiter_timeouts_total", "Queue deadlines that fired")?,
            queue_full_total: gauge(
                "gpu_arbiter_queue_full_total",
                "Admissions while the wait queue was at its limit",
            )?,
            watchdog_violations_total: gauge(
                "gpu_arbiter_watchdog_violations_total",
                "Leases held past their hold_max",
            )?,
            queue_depth: gauge("gpu_arbiter_queue_depth", "Requests waiting for the resource")?,
            high_pressure: gauge(
                "gpu_arbiter_high_pressure",
                "Admission state (1=high pressure, 0=normal)",
            )?,
            gpu_usage_percent: gauge("gpu_arbiter_gpu_usage_percent", "Cached GPU utilization percentage")?,
            lease_held: gauge("gpu_arbiter_lease_held", "Lease status (1=held, 0=free)")?,
            avg_queue_wait_ms: gauge(
                "gpu_arbiter_avg_queue_wait_ms",
                "Average of recent queue waits in milliseconds",
            )?,
            avg_hold_ms: gauge("gpu_arbiter_avg_hold_ms", "Average of recent hold times in milliseconds")?,
        })
    }

    fn all(&self) -> [&GaugeVec; 12] {
        [
            &self.acquired_total,
            &self.skipped_total,
            &self.fallback_cpu_total,
            &self.timeouts_total,
            &self.queue_full_total,
            &self.watchdog_violations_total,
            &self.queue_depth,
            &self.high_pressure,
            &self.gpu_usage_percent,
            &self.lease_held,
            &self.avg_queue_wait_ms,
            &self.avg_hold_ms,
        ]
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for gauge in self.all() {
            registry.register(Box::new(gauge.clone()))?;
        }
        Ok(())
    }

    /// Update gauges from a snapshot
    pub fn update_from_snapshot(&self, snapshot: &ArbiterSnapshot) {
        let labels = [snapshot.resource_key.as_str()];
        let metrics = &snapshot.metrics;

        self.acquired_total.with_label_values(&labels).set(metrics.acquired as f64);
        self.skipped_total.with_label_values(&labels).set(metrics.skipped as f64);
        self.fallback_cpu_total.with_label_values(&labels).set(metrics.fallback_cpu as f64);
        self.timeouts_total.with_label_values(&labels).set(metrics.timeouts as f64);
        self.queue_full_total.with_label_values(&labels).set(metrics.queue_full as f64);
        self.watchdog_violations_total
            .with_label_values(&labels)
            .set(metrics.watchdog_violations as f64);
        self.queue_depth.with_label_values(&labels).set(snapshot.queue.len() as f64);

        let pressure = match snapshot.admission_state {
            AdmissionState::HighPressure => 1.0,
            AdmissionState::Normal => 0.0,
        };
        self.high_pressure.with_label_values(&labels).set(pressure);

        match snapshot.gpu_usage_percent {
            Some(usage) => self.gpu_usage_percent.with_label_values(&labels).set(usage),
            None => {
                let _ = self.gpu_usage_percent.remove_label_values(&labels);
            }
        }

        let held = if snapshot.lease.is_some() { 1.0 } else { 0.0 };
        self.lease_held.with_label_values(&labels).set(held);

        self.avg_queue_wait_ms
            .with_label_values(&labels)
            .set(metrics.avg_queue_wait_ms().unwrap_or(0.0));
        self.avg_hold_ms
            .with_label_values(&labels)
            .set(metrics.avg_hold_ms().unwrap_or(0.0));
    }

    /// Render every gauge in the text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families: Vec<_> = self
            .all()
            .iter()
            .flat_map(|gauge| gauge.collect())
            .filter(|family| !family.get_metric().is_empty())
            .collect();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ArbiterError::Runtime(format!("metrics output is not UTF-8: {}", e)))
    }
}
