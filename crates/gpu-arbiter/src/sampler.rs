//! GPU usage sampler interface
//!
//! The arbiter never talks to a GPU driver itself. Hosts plug in a sampler
//! (NVML, `nvidia-smi`, a platform query) that returns one reading for the
//! physical GPU; the reading applies to every configured resource key.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One utilization reading from the sampler
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuUsageReading {
    /// Utilization percentage, `None` when the backend had no data
    pub usage_percent: Option<f64>,

    /// Memory utilization percentage
    pub memory_percent: f64,
}

impl GpuUsageReading {
    pub fn new(usage_percent: f64, memory_percent: f64) -> Self {
        Self {
            usage_percent: Some(usage_percent),
            memory_percent,
        }
    }

    /// A reading without utilization data
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Trait implemented by GPU utilization backends
#[async_trait]
pub trait UsageSampler: Send + Sync {
    /// Take one reading; errors skip the sampling cycle
    async fn sample(&self) -> Result<GpuUsageReading>;
}

/// Sampler returning a constant reading
#[derive(Debug, Clone)]
pub struct StaticUsageSampler {
    reading: GpuUsageReading,
}

impl StaticUsageSampler {
    pub fn new(usage_percent: Option<f64>) -> Self {
        Self {
            reading: GpuUsageReading {
                usage_percent,
                memory_percent: 0.0,
            },
        }
    }
}

#[async_trait]
impl UsageSampler for StaticUsageSampler {
    async fn sample(&self) -> Result<GpuUsageReading> {
        Ok(self.reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_sampler() {
        let sampler = StaticUsageSampler::new(Some(42.0));
        let reading = sampler.sample().await.unwrap();
        assert_eq!(reading.usage_percent, Some(42.0));

        let empty = StaticUsageSampler::new(None).sample().await.unwrap();
        assert_eq!(empty, GpuUsageReading::empty());
    }
}
