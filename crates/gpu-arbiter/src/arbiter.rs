//! GPU lease arbiter
//!
//! The [`Arbiter`] owns one lease slot per resource key. Every admission,
//! grant, release and drain runs while that slot's lock is held, so a key's
//! lease, its queue and its metrics always move together.

use crate::config::{ArbiterConfig, ArbiterConfigPatch};
use crate::deadline::Deadline;
use crate::metrics::{KeyMetricsSnapshot, MetricsManager};
use crate::monitor::{Thresholds, UsageMonitor};
use crate::queue::{GrantSink, QueueContext, QueueEntryView, QueueManager};
use crate::sampler::UsageSampler;
use crate::types::{
    AcquireOutcome, AcquireRequest, AdmissionState, LeaseId, ResourceKey, TaskHint, TaskType,
    TraceContext, CRITICAL_PRIORITY,
};
use crate::{ArbiterError, Result};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Lease {
    id: LeaseId,
    task_type: TaskType,
    priority: u8,
    acquired_at: Instant,
    acquired_wall: DateTime<Utc>,
    hold_max: Duration,
    trace: Option<TraceContext>,
    watchdog: Deadline,
    watchdog_fired: bool,
}

impl Lease {
    fn view(&self, key: &ResourceKey) -> LeaseView {
        LeaseView {
            lease_id: self.id,
            resource_key: key.clone(),
            task_type: self.task_type,
            priority: self.priority,
            acquired_at: self.acquired_wall,
            held_ms: self.acquired_at.elapsed().as_millis() as u64,
            hold_max_ms: self.hold_max.as_millis() as u64,
            watchdog_fired: self.watchdog_fired,
            trace: self.trace.clone(),
        }
    }
}

/// Read-only view of a held lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseView {
    pub lease_id: LeaseId,
    pub resource_key: ResourceKey,
    pub task_type: TaskType,
    pub priority: u8,
    pub acquired_at: DateTime<Utc>,
    pub held_ms: u64,
    pub hold_max_ms: u64,
    /// Set once the hold exceeded `hold_max`; the lease is kept regardless
    pub watchdog_fired: bool,
    pub trace: Option<TraceContext>,
}

/// Point-in-time state of one resource key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterSnapshot {
    pub resource_key: ResourceKey,
    pub admission_state: AdmissionState,
    pub gpu_usage_percent: Option<f64>,
    pub thresholds: Thresholds,
    pub lease: Option<LeaseView>,
    pub queue: Vec<QueueEntryView>,
    pub metrics: KeyMetricsSnapshot,
}

enum Admission {
    Decided(AcquireOutcome),
    Queued(oneshot::Receiver<AcquireOutcome>),
}

struct ArbiterInner {
    this: Weak<ArbiterInner>,
    config: RwLock<ArbiterConfig>,
    slots: HashMap<ResourceKey, Mutex<Option<Lease>>>,
    queues: QueueManager,
    monitor: UsageMonitor,
    metrics: MetricsManager,
    bypass_leases: Mutex<HashSet<LeaseId>>,
    next_lease_id: AtomicU64,
    runtime: Handle,
}

/// Grant path over one locked lease slot
struct SlotGrant<'a> {
    inner: &'a ArbiterInner,
    key: &'a ResourceKey,
    slot: &'a mut Option<Lease>,
}

impl GrantSink for SlotGrant<'_> {
    fn is_locked(&self) -> bool {
        self.slot.is_some()
    }

    fn admits(&self, request: &AcquireRequest) -> bool {
        match self.inner.monitor.admission_state(self.key) {
            AdmissionState::Normal => true,
            AdmissionState::HighPressure => request.is_high_priority(),
        }
    }

    fn grant(&mut self, lease_id: LeaseId, request: &AcquireRequest, queue_wait: Duration) -> AcquireOutcome {
        self.inner
            .install_lease(self.key, self.slot, lease_id, request, queue_wait)
    }

    fn revoke_abandoned(&mut self, lease_id: LeaseId) {
        if self.slot.as_ref().is_some_and(|lease| lease.id == lease_id) {
            if let Some(lease) = self.slot.take() {
                lease.watchdog.cancel();
                debug!("Revoked abandoned {} on {}", lease_id, self.key);
            }
        }
    }
}

impl QueueContext for ArbiterInner {
    fn admission_state(&self, key: &ResourceKey) -> AdmissionState {
        self.monitor.admission_state(key)
    }

    fn drain(&self, key: &ResourceKey) {
        ArbiterInner::drain(self, key);
    }
}

impl ArbiterInner {
    fn next_lease_id(&self) -> LeaseId {
        LeaseId::from_raw(self.next_lease_id.fetch_add(1, Ordering::Relaxed))
    }

    fn admit(&self, mut request: AcquireRequest) -> Result<Admission> {
        // Priority is capped at 100 even when set directly on the request
        request.priority = request.priority.min(100);

        let (enabled, default_queue_limit, critical_task_type) = {
            let config = self.config.read();
            (config.enabled, config.default_queue_limit, config.critical_task_type)
        };

        if !enabled {
            let lease_id = self.next_lease_id();
            self.bypass_leases.lock().insert(lease_id);
            debug!(
                "Arbitration disabled, granting {} on {} without locking {}",
                lease_id,
                request.resource_key,
                request.trace_label()
            );
            return Ok(Admission::Decided(AcquireOutcome::Acquired {
                lease_id,
                acquired_at: Utc::now(),
                queue_wait_ms: 0,
            }));
        }

        let key = request.resource_key.clone();
        let slot = self
            .slots
            .get(&key)
            .ok_or_else(|| ArbiterError::UnknownResourceKey(key.clone()))?;

        let mut guard = slot.lock();
        let state = self.monitor.admission_state(&key);
        let queued = self.queues.queue_len(&key);
        let queue_limit = request.queue_limit.unwrap_or(default_queue_limit);

        if queued >= queue_limit {
            warn!(
                "Queue for {} at {} (limit {}), still admitting {} request {}",
                key,
                queued,
                queue_limit,
                request.task_type,
                request.trace_label()
            );
            self.metrics.record_queue_full(&key);
        }

        let free = guard.is_none();
        let grant_now = match state {
            AdmissionState::Normal => free,
            AdmissionState::HighPressure => {
                let critical = free
                    && queued == 0
                    && request.task_type == critical_task_type
                    && request.priority >= CRITICAL_PRIORITY;
                if critical {
                    debug!("Critical {} request bypasses high pressure on {}", request.task_type, key);
                }
                critical || (free && request.is_high_priority())
            }
        };

        let lease_id = self.next_lease_id();
        if grant_now {
            let outcome = self.install_lease(&key, &mut *guard, lease_id, &request, Duration::ZERO);
            self.metrics.record_acquired(&key);
            info!(
                "Granted {} on {} to {} (priority {}) {}",
                lease_id,
                key,
                request.task_type,
                request.priority,
                request.trace_label()
            );
            return Ok(Admission::Decided(outcome));
        }

        let receiver = self.queues.enqueue_request(&key, request, lease_id)?;
        self.queues.process_queue(
            &key,
            &mut SlotGrant {
                inner: self,
                key: &key,
                slot: &mut *guard,
            },
        );
        Ok(Admission::Queued(receiver))
    }

    fn install_lease(
        &self,
        key: &ResourceKey,
        slot: &mut Option<Lease>,
        lease_id: LeaseId,
        request: &AcquireRequest,
        queue_wait: Duration,
    ) -> AcquireOutcome {
        let hold_max = request
            .hold_max
            .unwrap_or_else(|| self.config.read().default_hold_max());
        let acquired_wall = Utc::now();

        *slot = Some(Lease {
            id: lease_id,
            task_type: request.task_type,
            priority: request.priority,
            acquired_at: Instant::now(),
            acquired_wall,
            hold_max,
            trace: request.trace.clone(),
            watchdog: self.arm_watchdog(key, lease_id, hold_max),
            watchdog_fired: false,
        });

        AcquireOutcome::Acquired {
            lease_id,
            acquired_at: acquired_wall,
            queue_wait_ms: queue_wait.as_millis() as u64,
        }
    }

    fn arm_watchdog(&self, key: &ResourceKey, lease_id: LeaseId, hold_max: Duration) -> Deadline {
        let this = self.this.clone();
        let key = key.clone();
        Deadline::arm(&self.runtime, hold_max, move || {
            if let Some(inner) = this.upgrade() {
                inner.on_watchdog(&key, lease_id);
            }
        })
    }

    fn on_watchdog(&self, key: &ResourceKey, lease_id: LeaseId) {
        let Some(slot) = self.slots.get(key) else {
            return;
        };
        let mut guard = slot.lock();
        let Some(lease) = guard.as_mut().filter(|lease| lease.id == lease_id) else {
            return;
        };

        lease.watchdog_fired = true;
        self.metrics.record_watchdog_violation(key);
        warn!(
            "{} on {} held for {:?}, exceeding hold_max {:?}; lease kept {}",
            lease_id,
            key,
            lease.acquired_at.elapsed(),
            lease.hold_max,
            lease.trace.as_ref().map(|t| t.to_string()).unwrap_or_default()
        );
    }

    fn release(&self, lease_id: LeaseId) -> bool {
        if self.bypass_leases.lock().remove(&lease_id) {
            debug!("Released bypass {}", lease_id);
            return true;
        }

        for (key, slot) in &self.slots {
            let mut guard = slot.lock();
            if guard.as_ref().map(|lease| lease.id) != Some(lease_id) {
                continue;
            }

            if let Some(lease) = guard.take() {
                lease.watchdog.cancel();
                let held = lease.acquired_at.elapsed();
                self.metrics.record_hold(key, held);
                info!(
                    "Released {} on {} after {}ms",
                    lease_id,
                    key,
                    held.as_millis()
                );
            }

            self.queues.process_queue(
                key,
                &mut SlotGrant {
                    inner: self,
                    key,
                    slot: &mut *guard,
                },
            );
            return true;
        }

        warn!("Release of unknown {}, ignoring", lease_id);
        false
    }

    fn drain(&self, key: &ResourceKey) {
        let Some(slot) = self.slots.get(key) else {
            return;
        };
        let mut guard = slot.lock();
        self.queues.process_queue(
            key,
            &mut SlotGrant {
                inner: self,
                key,
                slot: &mut *guard,
            },
        );
    }

    fn lease_view(&self, key: &ResourceKey) -> Option<LeaseView> {
        self.slots.get(key)?.lock().as_ref().map(|lease| lease.view(key))
    }
}

/// Exclusive GPU lease arbiter with admission control.
///
/// Cloning yields another handle to the same arbiter.
#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<ArbiterInner>,
}

impl Arbiter {
    /// Create an arbiter for the configured resource keys.
    ///
    /// Must be called from within a Tokio runtime; sampling starts right away
    /// when arbitration is enabled.
    pub fn new(config: ArbiterConfig, sampler: Arc<dyn UsageSampler>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| ArbiterError::Runtime(format!("arbiter requires a Tokio runtime: {}", e)))?;

        let metrics = MetricsManager::new();
        let inner = Arc::new_cyclic(|this: &Weak<ArbiterInner>| {
            let context: Weak<dyn QueueContext> = this.clone();
            let queues = QueueManager::new(
                &config.resource_keys,
                metrics.clone(),
                context,
                runtime.clone(),
            );

            let monitor = UsageMonitor::new(
                config.gpu_usage.clone(),
                &config.resource_keys,
                sampler,
                runtime.clone(),
            );
            let recovery = this.clone();
            monitor.set_recovery_hook(Arc::new(move |key: &ResourceKey| {
                if let Some(inner) = recovery.upgrade() {
                    debug!("Draining {} after recovery", key);
                    inner.drain(key);
                }
            }));

            let slots = config
                .resource_keys
                .iter()
                .map(|key| (key.clone(), Mutex::new(None)))
                .collect();

            ArbiterInner {
                this: this.clone(),
                config: RwLock::new(config.clone()),
                slots,
                queues,
                monitor,
                metrics,
                bypass_leases: Mutex::new(HashSet::new()),
                next_lease_id: AtomicU64::new(1),
                runtime,
            }
        });

        info!(
            "GPU arbiter configured for {} resource(s), enabled={}, water marks {:.1}/{:.1}, legacy threshold {:.1}%",
            config.resource_keys.len(),
            config.enabled,
            config.gpu_usage.base_high_water,
            config.gpu_usage.base_low_water,
            config.gpu_usage_threshold
        );
        if config.enabled {
            inner.monitor.start_monitoring();
        }

        Ok(Self { inner })
    }

    /// Request an exclusive lease.
    ///
    /// Admission is decided when this is called, not when the returned future
    /// is first polled, so queue position follows call order. An unknown key
    /// fails before anything is queued. Dropping the future abandons the
    /// request: it stays queued until its deadline, and a grant reaching it is
    /// rolled back.
    pub fn acquire(
        &self,
        request: AcquireRequest,
    ) -> impl Future<Output = Result<AcquireOutcome>> + Send + 'static {
        let admission = self.inner.admit(request);
        async move {
            match admission? {
                Admission::Decided(outcome) => Ok(outcome),
                Admission::Queued(receiver) => receiver.await.map_err(|_| {
                    ArbiterError::Runtime("arbiter dropped before the request resolved".to_string())
                }),
            }
        }
    }

    /// Release a lease; unknown or already released ids are ignored.
    ///
    /// Returns whether a lease was released.
    pub fn release(&self, lease_id: LeaseId) -> bool {
        self.inner.release(lease_id)
    }

    /// Forward a producer hint about an upcoming task
    pub fn notify_task_hint(&self, key: &ResourceKey, hint: TaskHint) -> Result<()> {
        if !self.inner.slots.contains_key(key) {
            return Err(ArbiterError::UnknownResourceKey(key.clone()));
        }
        self.inner.monitor.notify_asr_task_hint(key, hint);
        Ok(())
    }

    pub fn snapshot(&self, key: &ResourceKey) -> Result<ArbiterSnapshot> {
        if !self.inner.slots.contains_key(key) {
            return Err(ArbiterError::UnknownResourceKey(key.clone()));
        }

        Ok(ArbiterSnapshot {
            resource_key: key.clone(),
            admission_state: self.inner.monitor.admission_state(key),
            gpu_usage_percent: self.inner.monitor.gpu_usage_from_cache(key),
            thresholds: self.inner.monitor.effective_thresholds(key),
            lease: self.inner.lease_view(key),
            queue: self.inner.queues.queue_snapshot(key),
            metrics: self.inner.metrics.snapshot(key),
        })
    }

    /// Snapshots of every resource key, ordered by key
    pub fn snapshots(&self) -> Vec<ArbiterSnapshot> {
        self.resource_keys()
            .iter()
            .filter_map(|key| self.snapshot(key).ok())
            .collect()
    }

    /// Apply a live configuration patch
    pub fn set_config(&self, patch: &ArbiterConfigPatch) -> Result<()> {
        let (was_enabled, now_enabled) = {
            let mut config = self.inner.config.write();
            let merged = config.merge(patch);
            merged.validate()?;
            let was_enabled = config.enabled;
            *config = merged;
            (was_enabled, config.enabled)
        };

        if let Some(gpu_usage) = &patch.gpu_usage {
            self.inner.monitor.update_config(gpu_usage)?;
        }

        match (was_enabled, now_enabled) {
            (true, false) => {
                info!("Arbitration disabled, requests bypass the arbiter");
                self.inner.monitor.stop_monitoring();
            }
            (false, true) => {
                info!("Arbitration enabled");
                self.inner.monitor.start_monitoring();
            }
            _ => debug!("Arbiter configuration updated"),
        }
        Ok(())
    }

    /// All currently held leases, ordered by resource key
    pub fn active_leases(&self) -> Vec<LeaseView> {
        self.resource_keys()
            .iter()
            .filter_map(|key| self.inner.lease_view(key))
            .collect()
    }

    /// Stop background sampling; held leases and queued requests are untouched
    pub fn shutdown(&self) {
        info!("Shutting down GPU arbiter");
        self.inner.monitor.stop_monitoring();
    }

    pub fn config(&self) -> ArbiterConfig {
        self.inner.config.read().clone()
    }

    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.inner.slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn usage_monitor(&self) -> &UsageMonitor {
        &self.inner.monitor
    }

    pub fn metrics(&self) -> &MetricsManager {
        &self.inner.metrics
    }
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbiter")
            .field("resource_keys", &self.resource_keys())
            .field("monitor", &self.inner.monitor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockUsageSampler;
    use crate::types::BusyPolicy;

    fn arbiter(config: ArbiterConfig) -> (Arbiter, MockUsageSampler) {
        let sampler = MockUsageSampler::new(40.0);
        let arbiter = Arbiter::new(config, Arc::new(sampler.clone())).unwrap();
        (arbiter, sampler)
    }

    fn gpu0() -> ResourceKey {
        ResourceKey::new("gpu0")
    }

    #[test]
    fn test_new_requires_runtime() {
        let config = ArbiterConfig::new(vec![gpu0()]);
        let err = Arbiter::new(config, Arc::new(MockUsageSampler::new(0.0))).unwrap_err();
        assert!(matches!(err, ArbiterError::Runtime(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_rejects_invalid_config() {
        let config = ArbiterConfig::new(vec![gpu0()]).with_water_marks(60.0, 70.0);
        let err = Arbiter::new(config, Arc::new(MockUsageSampler::new(0.0))).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_grant_and_release() {
        let (arbiter, _sampler) = arbiter(ArbiterConfig::new(vec![gpu0()]));
        let outcome = arbiter
            .acquire(AcquireRequest::new("gpu0", TaskType::Asr))
            .await
            .unwrap();

        let AcquireOutcome::Acquired { lease_id, queue_wait_ms, .. } = outcome else {
            panic!("expected a lease, got {:?}", outcome);
        };
        assert_eq!(queue_wait_ms, 0);
        assert_eq!(arbiter.active_leases().len(), 1);

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(arbiter.release(lease_id));
        assert!(!arbiter.release(lease_id));

        let snapshot = arbiter.snapshot(&gpu0()).unwrap();
        assert!(snapshot.lease.is_none());
        assert_eq!(snapshot.metrics.acquired, 1);
        assert_eq!(snapshot.metrics.recent_hold_ms, vec![30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_when_disabled() {
        let (arbiter, _sampler) = arbiter(ArbiterConfig::new(vec![gpu0()]).with_enabled(false));
        assert!(!arbiter.usage_monitor().is_monitoring());

        let first = arbiter
            .acquire(AcquireRequest::new("gpu0", TaskType::Nmt))
            .await
            .unwrap();
        let second = arbiter
            .acquire(AcquireRequest::new("gpu9", TaskType::Nmt))
            .await
            .unwrap();
        assert!(first.is_acquired() && second.is_acquired());
        assert_ne!(first.lease_id(), second.lease_id());
        assert!(arbiter.active_leases().is_empty());

        assert!(arbiter.release(first.lease_id().unwrap()));
        assert!(!arbiter.release(first.lease_id().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_fails_before_queueing() {
        let (arbiter, _sampler) = arbiter(ArbiterConfig::new(vec![gpu0()]));
        let result = arbiter
            .acquire(AcquireRequest::new("gpu9", TaskType::Tts))
            .await;
        assert!(matches!(result, Err(ArbiterError::UnknownResourceKey(_))));
        assert!(arbiter.snapshot(&ResourceKey::new("gpu9")).is_err());
        assert!(arbiter
            .notify_task_hint(&ResourceKey::new("gpu9"), TaskHint::default())
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_task_bypasses_pressure_on_idle_resource() {
        let (arbiter, sampler) = arbiter(ArbiterConfig::new(vec![gpu0()]));
        sampler.set_usage(95.0);
        arbiter.usage_monitor().sample_now().await;
        assert_eq!(
            arbiter.usage_monitor().admission_state(&gpu0()),
            AdmissionState::HighPressure
        );

        let critical = arbiter
            .acquire(AcquireRequest::new("gpu0", TaskType::Asr).with_priority(CRITICAL_PRIORITY))
            .await
            .unwrap();
        assert!(matches!(
            critical,
            AcquireOutcome::Acquired { queue_wait_ms: 0, .. }
        ));
        arbiter.release(critical.lease_id().unwrap());

        let low = arbiter
            .acquire(
                AcquireRequest::new("gpu0", TaskType::Tts)
                    .with_priority(40)
                    .with_max_wait(Duration::from_millis(50))
                    .with_busy_policy(BusyPolicy::FallbackCpu),
            )
            .await
            .unwrap();
        assert_eq!(low.status(), "FALLBACK_CPU");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_priority_is_clamped() {
        let (arbiter, _sampler) = arbiter(ArbiterConfig::new(vec![gpu0()]));
        let holder = arbiter
            .acquire(AcquireRequest::new("gpu0", TaskType::Asr))
            .await
            .unwrap();

        let mut request = AcquireRequest::new("gpu0", TaskType::Nmt);
        request.priority = 200;
        let _waiting = arbiter.acquire(request);

        let queue = arbiter.snapshot(&gpu0()).unwrap().queue;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].priority, 100);
        arbiter.release(holder.lease_id().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_config_toggles_sampling() {
        let (arbiter, _sampler) = arbiter(ArbiterConfig::new(vec![gpu0()]));
        assert!(arbiter.usage_monitor().is_monitoring());

        arbiter
            .set_config(&ArbiterConfigPatch {
                enabled: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(!arbiter.usage_monitor().is_monitoring());
        assert!(!arbiter.config().enabled);

        let invalid = arbiter.set_config(&ArbiterConfigPatch {
            default_queue_limit: Some(0),
            ..Default::default()
        });
        assert!(invalid.is_err());
        assert_eq!(arbiter.config().default_queue_limit, 8);

        arbiter
            .set_config(&ArbiterConfigPatch {
                enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(arbiter.usage_monitor().is_monitoring());

        arbiter.shutdown();
        assert!(!arbiter.usage_monitor().is_monitoring());
    }
}
