//! Per-resource counters and recent timing samples
//!
//! Pure bookkeeping: nothing here feeds back into admission decisions.

use crate::types::ResourceKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Number of recent queue-wait and hold samples kept per resource
pub const MAX_RECENT_SAMPLES: usize = 100;

#[derive(Debug, Default)]
struct KeyMetrics {
    acquired: u64,
    skipped: u64,
    fallback_cpu: u64,
    timeouts: u64,
    queue_full: u64,
    watchdog_violations: u64,
    queue_wait_ms: VecDeque<u64>,
    hold_ms: VecDeque<u64>,
}

/// Point-in-time copy of one resource's metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetricsSnapshot {
    pub acquired: u64,
    pub skipped: u64,
    pub fallback_cpu: u64,
    pub timeouts: u64,
    pub queue_full: u64,
    pub watchdog_violations: u64,
    pub recent_queue_wait_ms: Vec<u64>,
    pub recent_hold_ms: Vec<u64>,
}

impl KeyMetricsSnapshot {
    pub fn avg_queue_wait_ms(&self) -> Option<f64> {
        average(&self.recent_queue_wait_ms)
    }

    pub fn max_queue_wait_ms(&self) -> Option<u64> {
        self.recent_queue_wait_ms.iter().copied().max()
    }

    pub fn avg_hold_ms(&self) -> Option<f64> {
        average(&self.recent_hold_ms)
    }

    pub fn max_hold_ms(&self) -> Option<u64> {
        self.recent_hold_ms.iter().copied().max()
    }
}

fn average(samples: &[u64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }
}

fn push_capped(samples: &mut VecDeque<u64>, value: u64) {
    if samples.len() == MAX_RECENT_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(value);
}

/// Per-resource metrics registry
#[derive(Debug, Clone, Default)]
pub struct MetricsManager {
    keys: Arc<Mutex<HashMap<ResourceKey, KeyMetrics>>>,
}

impl MetricsManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_key(&self, key: &ResourceKey, update: impl FnOnce(&mut KeyMetrics)) {
        let mut keys = self.keys.lock();
        update(keys.entry(key.clone()).or_default());
    }

    pub fn record_acquired(&self, key: &ResourceKey) {
        self.with_key(key, |m| m.acquired += 1);
    }

    pub fn record_skipped(&self, key: &ResourceKey) {
        self.with_key(key, |m| m.skipped += 1);
    }

    pub fn record_fallback_cpu(&self, key: &ResourceKey) {
        self.with_key(key, |m| m.fallback_cpu += 1);
    }

    pub fn record_timeout(&self, key: &ResourceKey) {
        self.with_key(key, |m| m.timeouts += 1);
    }

    pub fn record_queue_full(&self, key: &ResourceKey) {
        self.with_key(key, |m| m.queue_full += 1);
    }

    pub fn record_watchdog_violation(&self, key: &ResourceKey) {
        self.with_key(key, |m| m.watchdog_violations += 1);
    }

    pub fn record_queue_wait(&self, key: &ResourceKey, wait: Duration) {
        self.with_key(key, |m| push_capped(&mut m.queue_wait_ms, wait.as_millis() as u64));
    }

    pub fn record_hold(&self, key: &ResourceKey, hold: Duration) {
        self.with_key(key, |m| push_capped(&mut m.hold_ms, hold.as_millis() as u64));
    }

    /// Copy of one resource's metrics; unknown keys yield zeroed metrics
    pub fn snapshot(&self, key: &ResourceKey) -> KeyMetricsSnapshot {
        let keys = self.keys.lock();
        match keys.get(key) {
            Some(m) => KeyMetricsSnapshot {
                acquired: m.acquired,
                skipped: m.skipped,
                fallback_cpu: m.fallback_cpu,
                timeouts: m.timeouts,
                queue_full: m.queue_full,
                watchdog_violations: m.watchdog_violations,
                recent_queue_wait_ms: m.queue_wait_ms.iter().copied().collect(),
                recent_hold_ms: m.hold_ms.iter().copied().collect(),
            },
            None => KeyMetricsSnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsManager::new();
        let key = ResourceKey::new("gpu0");

        metrics.record_acquired(&key);
        metrics.record_acquired(&key);
        metrics.record_skipped(&key);
        metrics.record_fallback_cpu(&key);
        metrics.record_timeout(&key);
        metrics.record_queue_full(&key);
        metrics.record_watchdog_violation(&key);

        let snapshot = metrics.snapshot(&key);
        assert_eq!(snapshot.acquired, 2);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.fallback_cpu, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.queue_full, 1);
        assert_eq!(snapshot.watchdog_violations, 1);

        assert_eq!(metrics.snapshot(&ResourceKey::new("gpu1")), KeyMetricsSnapshot::default());
    }

    #[test]
    fn test_samples_are_capped() {
        let metrics = MetricsManager::new();
        let key = ResourceKey::new("gpu0");

        for ms in 0..(MAX_RECENT_SAMPLES as u64 + 20) {
            metrics.record_hold(&key, Duration::from_millis(ms));
        }

        let snapshot = metrics.snapshot(&key);
        assert_eq!(snapshot.recent_hold_ms.len(), MAX_RECENT_SAMPLES);
        assert_eq!(snapshot.recent_hold_ms[0], 20);
        assert_eq!(snapshot.max_hold_ms(), Some(MAX_RECENT_SAMPLES as u64 + 19));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let metrics = MetricsManager::new();
        let key = ResourceKey::new("gpu0");
        metrics.record_queue_wait(&key, Duration::from_millis(10));
        metrics.record_queue_wait(&key, Duration::from_millis(30));

        let mut snapshot = metrics.snapshot(&key);
        assert_eq!(snapshot.avg_queue_wait_ms(), Some(20.0));
        snapshot.recent_queue_wait_ms.clear();
        snapshot.acquired = 99;

        let fresh = metrics.snapshot(&key);
        assert_eq!(fresh.recent_queue_wait_ms, vec![10, 30]);
        assert_eq!(fresh.acquired, 0);
    }
}
