//! Mock usage sampler for testing

use crate::sampler::{GpuUsageReading, UsageSampler};
use crate::{ArbiterError, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Scripted reading returned by the mock
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockReading {
    Usage(f64),
    NoData,
    Failure,
}

/// Mock sampler with a settable current reading and an optional script.
///
/// Scripted readings are consumed first, one per sample; after that the
/// current reading is returned on every call.
#[derive(Debug, Clone)]
pub struct MockUsageSampler {
    current: Arc<Mutex<MockReading>>,
    script: Arc<Mutex<VecDeque<MockReading>>>,
    calls: Arc<AtomicU64>,
}

impl MockUsageSampler {
    /// Create a mock returning the given usage
    pub fn new(usage_percent: f64) -> Self {
        Self::with_reading(MockReading::Usage(usage_percent))
    }

    /// Create a mock returning no data
    pub fn no_data() -> Self {
        Self::with_reading(MockReading::NoData)
    }

    pub fn with_reading(reading: MockReading) -> Self {
        Self {
            current: Arc::new(Mutex::new(reading)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Change the reading returned once the script is exhausted
    pub fn set_usage(&self, usage_percent: f64) {
        *self.current.lock() = MockReading::Usage(usage_percent);
    }

    pub fn set_reading(&self, reading: MockReading) {
        *self.current.lock() = reading;
    }

    /// Queue readings to return before the current one
    pub fn push_script(&self, readings: impl IntoIterator<Item = MockReading>) {
        self.script.lock().extend(readings);
    }

    /// Number of times `sample` was called
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageSampler for MockUsageSampler {
    async fn sample(&self) -> Result<GpuUsageReading> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reading = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.current.lock());

        debug!("Mock sampler returning {:?}", reading);
        match reading {
            MockReading::Usage(percent) => Ok(GpuUsageReading::new(percent, 0.0)),
            MockReading::NoData => Ok(GpuUsageReading::empty()),
            MockReading::Failure => Err(ArbiterError::sampler("mock sampler failure")),
        }
    }
}
