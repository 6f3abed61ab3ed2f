//! Simulation configuration

use crate::workload::WorkloadConfig;
use anyhow::{Context, Result};
use gpu_arbiter::{ArbiterConfig, ResourceKey};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Arbiter configuration plus the synthetic workload driven against it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub arbiter: ArbiterConfig,
    pub workload: WorkloadConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arbiter: ArbiterConfig::new(vec![ResourceKey::new("gpu0")]),
            workload: WorkloadConfig::default(),
        }
    }
}

impl SimConfig {
    /// Two GPUs, more sessions and a usage signal that crosses the water marks
    pub fn busy() -> Self {
        let mut config = Self::default();
        config.arbiter.resource_keys = vec![ResourceKey::new("gpu0"), ResourceKey::new("gpu1")];
        config.workload.sessions = 8;
        config.workload.usage.baseline = 75.0;
        config.workload.usage.amplitude = 20.0;
        config
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {:?}", path))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration {:?}", path))?;
        Ok(config)
    }

    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.arbiter.validate().context("Invalid arbiter configuration")?;
        self.workload.validate().context("Invalid workload configuration")?;
        Ok(())
    }
}
