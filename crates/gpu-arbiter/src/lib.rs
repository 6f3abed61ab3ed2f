//! # gpu-arbiter
//!
//! GPU lease arbitration and admission control for the speech translation
//! pipeline (ASR → NMT → TTS).
//!
//! This crate provides:
//! - Exclusive, explicitly released leases on GPU resource keys
//! - Strict FIFO wait queues with per-request deadlines
//! - Hysteresis-debounced admission control driven by sampled GPU utilization
//! - Temporary threshold boosts for anticipated long tasks
//! - Per-key counters and recent timing samples, with Prometheus export
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gpu_arbiter::{AcquireOutcome, AcquireRequest, Arbiter, ArbiterConfig, TaskType};
//! use gpu_arbiter::sampler::StaticUsageSampler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ArbiterConfig::new(vec!["gpu0".into()]);
//!     let arbiter = Arbiter::new(config, Arc::new(StaticUsageSampler::new(Some(40.0))))?;
//!
//!     let request = AcquireRequest::new("gpu0", TaskType::Asr)
//!         .with_priority(80)
//!         .with_max_wait(Duration::from_millis(500));
//!
//!     if let AcquireOutcome::Acquired { lease_id, .. } = arbiter.acquire(request).await? {
//!         // run inference on the GPU
//!         arbiter.release(lease_id);
//!     }
//!
//!     arbiter.shutdown();
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod arbiter;
pub mod config;
pub mod deadline;
pub mod export;
pub mod metrics;
pub mod mock;
pub mod monitor;
pub mod queue;
pub mod sampler;
pub mod types;

// Re-export main types
pub use arbiter::{Arbiter, ArbiterSnapshot, LeaseView};
pub use config::{
    ArbiterConfig, ArbiterConfigPatch, DynamicAdjustmentConfig, DynamicAdjustmentPatch,
    GpuUsageConfig, GpuUsagePatch,
};
pub use deadline::Deadline;
pub use export::ArbiterPrometheusMetrics;
pub use metrics::{KeyMetricsSnapshot, MetricsManager};
pub use mock::{MockReading, MockUsageSampler};
pub use monitor::{DynamicAdjustment, Thresholds, UsageMonitor};
pub use queue::{QueueEntryView, QueueManager};
pub use sampler::{GpuUsageReading, StaticUsageSampler, UsageSampler};
pub use types::{
    AcquireOutcome, AcquireRequest, AdmissionState, BusyPolicy, LeaseId, ResourceKey, TaskHint,
    TaskType, TraceContext, UsageSample,
};

/// Result type for arbiter operations
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Errors that can occur in the arbiter
#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown resource key: {0}")]
    UnknownResourceKey(ResourceKey),

    #[error("Usage sampler error: {0}")]
    Sampler(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArbiterError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a sampler error
    pub fn sampler(msg: impl Into<String>) -> Self {
        Self::Sampler(msg.into())
    }

    /// Check if this error is a caller or configuration bug rather than a runtime condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArbiterError::InvalidConfiguration(_)
                | ArbiterError::UnknownResourceKey(_)
                | ArbiterError::Runtime(_)
        )
    }

    /// Check if this error came from configuration handling
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ArbiterError::InvalidConfiguration(_)
                | ArbiterError::UnknownResourceKey(_)
                | ArbiterError::Yaml(_)
        )
    }
}
