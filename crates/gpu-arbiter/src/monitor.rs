//! GPU usage monitoring and admission state
//!
//! The monitor polls a [`UsageSampler`] on a fixed interval, caches the
//! reading for every resource key and runs a two-threshold hysteresis state
//! machine per key. Long-task hints temporarily raise the thresholds.

use crate::config::{GpuUsageConfig, GpuUsagePatch};
use crate::sampler::UsageSampler;
use crate::types::{AdmissionState, ResourceKey, TaskHint, UsageSample};
use crate::Result;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Callback invoked for every HIGH_PRESSURE → NORMAL transition
pub type RecoveryHook = Arc<dyn Fn(&ResourceKey) + Send + Sync>;

/// Water marks used for hysteresis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub high_water: f64,
    pub low_water: f64,
}

impl Thresholds {
    fn base(config: &GpuUsageConfig) -> Self {
        Self {
            high_water: config.base_high_water,
            low_water: config.base_low_water,
        }
    }
}

/// Temporary threshold override installed by a long-task hint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicAdjustment {
    pub high_water: f64,
    pub low_water: f64,
    pub expires_at: Instant,
}

impl DynamicAdjustment {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            high_water: self.high_water,
            low_water: self.low_water,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct KeyUsage {
    sample: Option<UsageSample>,
    state: AdmissionState,
    adjustment: Option<DynamicAdjustment>,
}

impl KeyUsage {
    /// Adjustment in force at `now`, if any
    fn active_adjustment(&self, config: &GpuUsageConfig, now: Instant) -> Option<DynamicAdjustment> {
        if !config.dynamic_adjustment.enabled {
            return None;
        }
        self.adjustment.filter(|adj| !adj.is_expired(now))
    }

    fn thresholds(&self, config: &GpuUsageConfig, now: Instant) -> Thresholds {
        self.active_adjustment(config, now)
            .map(|adj| adj.thresholds())
            .unwrap_or_else(|| Thresholds::base(config))
    }

    fn reclaim_expired(&mut self, key: &ResourceKey, now: Instant) {
        if self.adjustment.is_some_and(|adj| adj.is_expired(now)) {
            debug!("Threshold adjustment on {} expired", key);
            self.adjustment = None;
        }
    }
}

struct MonitorState {
    config: GpuUsageConfig,
    keys: HashMap<ResourceKey, KeyUsage>,
}

struct MonitorShared {
    sampler: Arc<dyn UsageSampler>,
    state: Mutex<MonitorState>,
    recovery_hook: RwLock<Option<RecoveryHook>>,
}

impl MonitorShared {
    async fn sample_once(&self) {
        match self.sampler.sample().await {
            Ok(reading) => match reading.usage_percent {
                Some(percent) => self.ingest(percent),
                None => debug!("Usage sampler returned no data, skipping cycle"),
            },
            Err(e) => warn!("Usage sampling failed, skipping cycle: {}", e),
        }
    }

    fn ingest(&self, usage_percent: f64) {
        if !usage_percent.is_finite() {
            warn!("Ignoring non-finite usage reading {}", usage_percent);
            return;
        }

        let now = Instant::now();
        let mut recovered = Vec::new();
        {
            let mut state = self.state.lock();
            let MonitorState { config, keys } = &mut *state;

            for (key, usage) in keys.iter_mut() {
                usage.sample = Some(UsageSample {
                    usage_percent,
                    sampled_at: now,
                });
                usage.reclaim_expired(key, now);
                let thresholds = usage.thresholds(config, now);

                match usage.state {
                    AdmissionState::Normal if usage_percent >= thresholds.high_water => {
                        usage.state = AdmissionState::HighPressure;
                        info!(
                            "{} entering HIGH_PRESSURE at {:.1}% (high water {:.1}%)",
                            key, usage_percent, thresholds.high_water
                        );
                    }
                    AdmissionState::HighPressure if usage_percent <= thresholds.low_water => {
                        usage.state = AdmissionState::Normal;
                        info!(
                            "{} recovered to NORMAL at {:.1}% (low water {:.1}%)",
                            key, usage_percent, thresholds.low_water
                        );
                        recovered.push(key.clone());
                    }
                    _ => {}
                }
            }
        }

        if recovered.is_empty() {
            return;
        }
        let hook = self.recovery_hook.read().clone();
        if let Some(hook) = hook {
            for key in &recovered {
                hook(key);
            }
        }
    }
}

/// Samples GPU usage and tracks per-key admission state
pub struct UsageMonitor {
    shared: Arc<MonitorShared>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UsageMonitor {
    /// Create a monitor for a fixed set of resource keys; sampling is not started
    pub fn new(
        config: GpuUsageConfig,
        resource_keys: &[ResourceKey],
        sampler: Arc<dyn UsageSampler>,
        runtime: Handle,
    ) -> Self {
        let keys = resource_keys
            .iter()
            .map(|key| (key.clone(), KeyUsage::default()))
            .collect();

        Self {
            shared: Arc::new(MonitorShared {
                sampler,
                state: Mutex::new(MonitorState { config, keys }),
                recovery_hook: RwLock::new(None),
            }),
            runtime,
            task: Mutex::new(None),
        }
    }

    /// Install the callback run on every recovery to NORMAL
    pub fn set_recovery_hook(&self, hook: RecoveryHook) {
        *self.shared.recovery_hook.write() = Some(hook);
    }

    /// Start the periodic sampling loop; no-op if already running
    pub fn start_monitoring(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Usage monitoring already running");
            return;
        }

        let interval = self.shared.state.lock().config.sample_interval();
        info!("Starting GPU usage monitoring every {:?}", interval);

        let shared = Arc::clone(&self.shared);
        *task = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.sample_once().await;
            }
        }));
    }

    /// Stop the sampling loop; no-op if not running
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.task.lock().take() {
            info!("Stopping GPU usage monitoring");
            handle.abort();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Take one sample immediately, outside the periodic loop
    pub async fn sample_now(&self) {
        self.shared.sample_once().await;
    }

    /// Feed a usage reading as if the sampler had returned it
    pub fn ingest_usage(&self, usage_percent: f64) {
        self.shared.ingest(usage_percent);
    }

    /// Current admission state; unknown keys are NORMAL
    pub fn admission_state(&self, key: &ResourceKey) -> AdmissionState {
        self.shared
            .state
            .lock()
            .keys
            .get(key)
            .map(|usage| usage.state)
            .unwrap_or_default()
    }

    /// Cached usage if the last sample is within the cache TTL
    pub fn gpu_usage_from_cache(&self, key: &ResourceKey) -> Option<f64> {
        let state = self.shared.state.lock();
        let ttl = state.config.cache_ttl();
        let sample = state.keys.get(key)?.sample?;
        (sample.sampled_at.elapsed() <= ttl).then_some(sample.usage_percent)
    }

    /// Water marks in force for a key right now
    pub fn effective_thresholds(&self, key: &ResourceKey) -> Thresholds {
        let state = self.shared.state.lock();
        let now = Instant::now();
        state
            .keys
            .get(key)
            .map(|usage| usage.thresholds(&state.config, now))
            .unwrap_or_else(|| Thresholds::base(&state.config))
    }

    pub fn active_adjustment(&self, key: &ResourceKey) -> Option<DynamicAdjustment> {
        let state = self.shared.state.lock();
        state
            .keys
            .get(key)?
            .active_adjustment(&state.config, Instant::now())
    }

    /// Install a boosted threshold override when the hinted task is long
    pub fn notify_asr_task_hint(&self, key: &ResourceKey, hint: TaskHint) {
        let mut state = self.shared.state.lock();
        let adjustment = state.config.dynamic_adjustment.clone();
        if !adjustment.enabled || hint.estimated_duration_ms <= adjustment.long_audio_threshold_ms {
            return;
        }

        let base = Thresholds::base(&state.config);
        let (high_water, mut low_water) = state.config.boosted_water_marks();
        // Capping at 100 can collapse the band; keep the base low water then
        if low_water >= high_water {
            low_water = base.low_water;
        }
        let Some(usage) = state.keys.get_mut(key) else {
            debug!("Ignoring task hint for unknown resource {}", key);
            return;
        };

        let boosted = DynamicAdjustment {
            high_water,
            low_water,
            expires_at: Instant::now() + adjustment.adjustment_ttl(),
        };
        info!(
            "Raising thresholds on {} to {:.1}/{:.1} for {:?} (hinted task {}ms)",
            key,
            boosted.high_water,
            boosted.low_water,
            adjustment.adjustment_ttl(),
            hint.estimated_duration_ms
        );
        usage.adjustment = Some(boosted);
    }

    /// Apply a live patch; the sampling loop restarts only when the interval changed
    pub fn update_config(&self, patch: &GpuUsagePatch) -> Result<()> {
        let interval_changed = {
            let mut state = self.shared.state.lock();
            let merged = state.config.merge(patch);
            merged.validate()?;
            let changed = merged.sample_interval_ms != state.config.sample_interval_ms;
            state.config = merged;
            changed
        };

        if interval_changed && self.is_monitoring() {
            debug!("Sample interval changed, restarting usage monitoring");
            self.stop_monitoring();
            self.start_monitoring();
        }
        Ok(())
    }

    pub fn config(&self) -> GpuUsageConfig {
        self.shared.state.lock().config.clone()
    }
}

impl Drop for UsageMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for UsageMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMonitor")
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}
