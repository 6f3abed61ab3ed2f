//! Core type definitions for the arbiter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Priority at or above which a request may be granted under high pressure
pub const HIGH_PRIORITY: u8 = 70;

/// Priority at or above which a critical task may bypass high pressure on an idle resource
pub const CRITICAL_PRIORITY: u8 = 90;

/// Identifier of one arbitrated GPU resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a new resource key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the string representation of the key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Unique lease identifier, also pre-allocated for queued requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(u64);

impl LeaseId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value of the id
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Pipeline stage requesting the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Speech recognition
    Asr,
    /// Machine translation
    Nmt,
    /// Speech synthesis
    Tts,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Asr => write!(f, "asr"),
            TaskType::Nmt => write!(f, "nmt"),
            TaskType::Tts => write!(f, "tts"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asr" => Ok(TaskType::Asr),
            "nmt" => Ok(TaskType::Nmt),
            "tts" => Ok(TaskType::Tts),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// What the caller wants when the resource stays busy past its wait budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Wait in the queue and be skipped on timeout
    #[default]
    Wait,
    /// Wait in the queue and fall back to CPU on timeout
    FallbackCpu,
}

/// Hysteresis-debounced pressure classification of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionState {
    #[default]
    Normal,
    HighPressure,
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionState::Normal => write!(f, "NORMAL"),
            AdmissionState::HighPressure => write!(f, "HIGH_PRESSURE"),
        }
    }
}

/// Opaque correlation data threaded through logs, never interpreted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceContext(BTreeMap<String, String>);

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a correlation field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

/// A request for an exclusive GPU lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireRequest {
    /// Resource to lease
    pub resource_key: ResourceKey,

    /// Pipeline stage of the task
    pub task_type: TaskType,

    /// Priority from 0 to 100
    pub priority: u8,

    /// How long the request may wait in the queue
    pub max_wait: Duration,

    /// Expected maximum hold; falls back to the configured default
    pub hold_max: Option<Duration>,

    /// Queue length at which backpressure is signalled; falls back to the configured default
    pub queue_limit: Option<usize>,

    /// Outcome wanted when the wait budget runs out
    pub busy_policy: BusyPolicy,

    /// Correlation data for logs
    pub trace: Option<TraceContext>,
}

impl AcquireRequest {
    /// Create a request with priority 50, a 5 second wait budget and the `Wait` policy
    pub fn new(resource_key: impl Into<ResourceKey>, task_type: TaskType) -> Self {
        Self {
            resource_key: resource_key.into(),
            task_type,
            priority: 50,
            max_wait: Duration::from_secs(5),
            hold_max: None,
            queue_limit: None,
            busy_policy: BusyPolicy::Wait,
            trace: None,
        }
    }

    /// Set the priority, clamped to 100
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(100);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_hold_max(mut self, hold_max: Duration) -> Self {
        self.hold_max = Some(hold_max);
        self
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit);
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Whether this request may be granted while the resource is under high pressure
    pub fn is_high_priority(&self) -> bool {
        self.priority >= HIGH_PRIORITY
    }

    pub(crate) fn trace_label(&self) -> String {
        self.trace.as_ref().map(|t| t.to_string()).unwrap_or_default()
    }
}

/// Terminal result of an `acquire` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireOutcome {
    /// The lease is held and must be released explicitly
    Acquired {
        lease_id: LeaseId,
        acquired_at: DateTime<Utc>,
        queue_wait_ms: u64,
    },
    /// A high priority request waited under high pressure past its budget
    Timeout { reason: String },
    /// The caller should run the task on CPU instead
    FallbackCpu { reason: String },
    /// The task should be skipped
    Skipped { reason: String },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired { .. })
    }

    /// Lease id of an acquired outcome
    pub fn lease_id(&self) -> Option<LeaseId> {
        match self {
            AcquireOutcome::Acquired { lease_id, .. } => Some(*lease_id),
            _ => None,
        }
    }

    /// Short status label used in logs and metrics
    pub fn status(&self) -> &'static str {
        match self {
            AcquireOutcome::Acquired { .. } => "ACQUIRED",
            AcquireOutcome::Timeout { .. } => "TIMEOUT",
            AcquireOutcome::FallbackCpu { .. } => "FALLBACK_CPU",
            AcquireOutcome::Skipped { .. } => "SKIPPED",
        }
    }
}

/// Cached utilization reading for one resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    pub usage_percent: f64,
    pub sampled_at: tokio::time::Instant,
}

/// Producer hint about an upcoming task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskHint {
    /// Expected duration of the audio or task
    pub estimated_duration_ms: u64,

    /// Expected GPU hold time
    pub estimated_hold_ms: u64,
}
