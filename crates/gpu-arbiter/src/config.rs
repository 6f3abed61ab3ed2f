//! Arbiter configuration

use crate::types::{ResourceKey, TaskType};
use crate::{ArbiterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Arbiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Enable arbitration; when disabled every request is granted without locking
    pub enabled: bool,

    /// Arbitrated GPU resources
    pub resource_keys: Vec<ResourceKey>,

    /// Queue length at which backpressure is signalled
    pub default_queue_limit: usize,

    /// Hold time after which the lease watchdog flags a violation (milliseconds)
    pub default_hold_max_ms: u64,

    /// Legacy single threshold, only reported in logs
    pub gpu_usage_threshold: f64,

    /// Task type allowed to bypass high pressure on an idle resource
    pub critical_task_type: TaskType,

    /// Usage sampling and hysteresis configuration
    pub gpu_usage: GpuUsageConfig,
}

/// Usage sampling and hysteresis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuUsageConfig {
    /// Sampling interval (milliseconds)
    pub sample_interval_ms: u64,

    /// How long a cached sample stays valid (milliseconds)
    pub cache_ttl_ms: u64,

    /// Usage percentage entering high pressure
    pub base_high_water: f64,

    /// Usage percentage leaving high pressure
    pub base_low_water: f64,

    /// Temporary threshold boosts for long tasks
    pub dynamic_adjustment: DynamicAdjustmentConfig,
}

/// Temporary threshold boosts for long tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicAdjustmentConfig {
    pub enabled: bool,

    /// Hinted durations above this install a boost (milliseconds)
    pub long_audio_threshold_ms: u64,

    pub high_water_boost: f64,

    pub low_water_boost: f64,

    /// Lifetime of an installed boost (milliseconds)
    pub adjustment_ttl_ms: u64,
}

/// Partial update of [`ArbiterConfig`]; the resource key set is fixed at construction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfigPatch {
    pub enabled: Option<bool>,
    pub default_queue_limit: Option<usize>,
    pub default_hold_max_ms: Option<u64>,
    pub gpu_usage_threshold: Option<f64>,
    pub critical_task_type: Option<TaskType>,
    pub gpu_usage: Option<GpuUsagePatch>,
}

/// Partial update of [`GpuUsageConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuUsagePatch {
    pub sample_interval_ms: Option<u64>,
    pub cache_ttl_ms: Option<u64>,
    pub base_high_water: Option<f64>,
    pub base_low_water: Option<f64>,
    pub dynamic_adjustment: Option<DynamicAdjustmentPatch>,
}

/// Partial update of [`DynamicAdjustmentConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicAdjustmentPatch {
    pub enabled: Option<bool>,
    pub long_audio_threshold_ms: Option<u64>,
    pub high_water_boost: Option<f64>,
    pub low_water_boost: Option<f64>,
    pub adjustment_ttl_ms: Option<u64>,
}

impl ArbiterConfig {
    /// Create a configuration for the given resource keys with default policy values
    pub fn new(resource_keys: Vec<ResourceKey>) -> Self {
        Self {
            resource_keys,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.default_queue_limit = limit;
        self
    }

    pub fn with_hold_max(mut self, hold_max: Duration) -> Self {
        self.default_hold_max_ms = hold_max.as_millis() as u64;
        self
    }

    /// Set the hysteresis water marks
    pub fn with_water_marks(mut self, high_water: f64, low_water: f64) -> Self {
        self.gpu_usage.base_high_water = high_water;
        self.gpu_usage.base_low_water = low_water;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.gpu_usage.sample_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.gpu_usage.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_dynamic_adjustment(mut self, adjustment: DynamicAdjustmentConfig) -> Self {
        self.gpu_usage.dynamic_adjustment = adjustment;
        self
    }

    pub fn with_critical_task_type(mut self, task_type: TaskType) -> Self {
        self.critical_task_type = task_type;
        self
    }

    pub fn default_hold_max(&self) -> Duration {
        Duration::from_millis(self.default_hold_max_ms)
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ArbiterConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply a patch, returning the merged configuration
    pub fn merge(&self, patch: &ArbiterConfigPatch) -> Self {
        let mut merged = self.clone();
        if let Some(enabled) = patch.enabled {
            merged.enabled = enabled;
        }
        if let Some(limit) = patch.default_queue_limit {
            merged.default_queue_limit = limit;
        }
        if let Some(hold_max) = patch.default_hold_max_ms {
            merged.default_hold_max_ms = hold_max;
        }
        if let Some(threshold) = patch.gpu_usage_threshold {
            merged.gpu_usage_threshold = threshold;
        }
        if let Some(task_type) = patch.critical_task_type {
            merged.critical_task_type = task_type;
        }
        if let Some(gpu_usage) = &patch.gpu_usage {
            merged.gpu_usage = merged.gpu_usage.merge(gpu_usage);
        }
        merged
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.resource_keys.is_empty() {
            return Err(ArbiterError::config("at least one resource key is required"));
        }

        let mut seen = HashSet::new();
        for key in &self.resource_keys {
            if key.as_str().is_empty() {
                return Err(ArbiterError::config("resource keys cannot be empty"));
            }
            if !seen.insert(key) {
                return Err(ArbiterError::config(format!("duplicate resource key: {}", key)));
            }
        }

        if self.default_queue_limit == 0 {
            return Err(ArbiterError::config("default_queue_limit must be greater than zero"));
        }

        if self.default_hold_max_ms == 0 {
            return Err(ArbiterError::config("default_hold_max_ms must be greater than zero"));
        }

        if !(0.0..=100.0).contains(&self.gpu_usage_threshold) {
            return Err(ArbiterError::config("gpu_usage_threshold must be between 0 and 100"));
        }

        self.gpu_usage.validate()
    }
}

impl GpuUsageConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Apply a patch, returning the merged configuration
    pub fn merge(&self, patch: &GpuUsagePatch) -> Self {
        let mut merged = self.clone();
        if let Some(interval) = patch.sample_interval_ms {
            merged.sample_interval_ms = interval;
        }
        if let Some(ttl) = patch.cache_ttl_ms {
            merged.cache_ttl_ms = ttl;
        }
        if let Some(high_water) = patch.base_high_water {
            merged.base_high_water = high_water;
        }
        if let Some(low_water) = patch.base_low_water {
            merged.base_low_water = low_water;
        }
        if let Some(adjustment) = &patch.dynamic_adjustment {
            merged.dynamic_adjustment = merged.dynamic_adjustment.merge(adjustment);
        }
        merged
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(ArbiterError::config("sample_interval_ms must be greater than zero"));
        }

        if self.cache_ttl_ms == 0 {
            return Err(ArbiterError::config("cache_ttl_ms must be greater than zero"));
        }

        for (name, value) in [
            ("base_high_water", self.base_high_water),
            ("base_low_water", self.base_low_water),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ArbiterError::config(format!("{} must be between 0 and 100", name)));
            }
        }

        if self.base_low_water >= self.base_high_water {
            return Err(ArbiterError::config(format!(
                "base_low_water ({}) must be below base_high_water ({})",
                self.base_low_water, self.base_high_water
            )));
        }

        self.dynamic_adjustment.validate()?;

        if self.dynamic_adjustment.enabled {
            let boosted = self.boosted_water_marks();
            if boosted.1 >= boosted.0 {
                return Err(ArbiterError::config(format!(
                    "boosted low water ({}) must stay below boosted high water ({})",
                    boosted.1, boosted.0
                )));
            }
        }

        Ok(())
    }

    /// High and low water marks while a long-task adjustment is active, capped at 100
    pub fn boosted_water_marks(&self) -> (f64, f64) {
        let adjustment = &self.dynamic_adjustment;
        (
            (self.base_high_water + adjustment.high_water_boost).min(100.0),
            (self.base_low_water + adjustment.low_water_boost).min(100.0),
        )
    }
}

impl DynamicAdjustmentConfig {
    pub fn adjustment_ttl(&self) -> Duration {
        Duration::from_millis(self.adjustment_ttl_ms)
    }

    /// Apply a patch, returning the merged configuration
    pub fn merge(&self, patch: &DynamicAdjustmentPatch) -> Self {
        let mut merged = self.clone();
        if let Some(enabled) = patch.enabled {
            merged.enabled = enabled;
        }
        if let Some(threshold) = patch.long_audio_threshold_ms {
            merged.long_audio_threshold_ms = threshold;
        }
        if let Some(boost) = patch.high_water_boost {
            merged.high_water_boost = boost;
        }
        if let Some(boost) = patch.low_water_boost {
            merged.low_water_boost = boost;
        }
        if let Some(ttl) = patch.adjustment_ttl_ms {
            merged.adjustment_ttl_ms = ttl;
        }
        merged
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.high_water_boost < 0.0 || self.low_water_boost < 0.0 {
            return Err(ArbiterError::config("water mark boosts cannot be negative"));
        }

        if self.enabled && self.adjustment_ttl_ms == 0 {
            return Err(ArbiterError::config("adjustment_ttl_ms must be greater than zero"));
        }

        Ok(())
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_keys: Vec::new(),
            default_queue_limit: 8,
            default_hold_max_ms: 30_000, // 30 seconds
            gpu_usage_threshold: 85.0,
            critical_task_type: TaskType::Asr,
            gpu_usage: GpuUsageConfig::default(),
        }
    }
}

impl Default for GpuUsageConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 800,
            cache_ttl_ms: 2_000,
            base_high_water: 85.0,
            base_low_water: 78.0,
            dynamic_adjustment: DynamicAdjustmentConfig::default(),
        }
    }
}

impl Default for DynamicAdjustmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            long_audio_threshold_ms: 10_000,
            high_water_boost: 5.0,
            low_water_boost: 5.0,
            adjustment_ttl_ms: 30_000,
        }
    }
}
