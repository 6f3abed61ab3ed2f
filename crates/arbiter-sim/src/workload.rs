//! Synthetic speech pipeline workload

use anyhow::{bail, Result};
use async_trait::async_trait;
use gpu_arbiter::{
    AcquireOutcome, AcquireRequest, Arbiter, BusyPolicy, GpuUsageReading, ResourceKey, TaskHint,
    TaskType, TraceContext, UsageSampler,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Synthetic GPU utilization signal: a sine wave plus uniform noise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageSignalConfig {
    pub baseline: f64,
    pub amplitude: f64,
    pub period_s: f64,
    pub noise: f64,
}

impl Default for UsageSignalConfig {
    fn default() -> Self {
        Self {
            baseline: 60.0,
            amplitude: 25.0,
            period_s: 20.0,
            noise: 3.0,
        }
    }
}

/// How one pipeline stage asks for the GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProfile {
    pub priority: u8,
    pub max_wait_ms: u64,
    pub busy_policy: BusyPolicy,
    /// GPU time per second of input audio
    pub hold_per_audio_s_ms: u64,
}

impl StageProfile {
    fn hold_for(&self, audio_ms: u64) -> Duration {
        Duration::from_millis(self.hold_per_audio_s_ms.saturating_mul(audio_ms) / 1_000)
    }
}

/// Workload shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub duration_s: f64,
    pub seed: u64,

    /// Concurrent producer sessions
    pub sessions: usize,

    pub audio_min_ms: u64,
    pub audio_max_ms: u64,

    /// Pause between utterances of one session
    pub utterance_gap_ms: u64,

    pub asr: StageProfile,
    pub nmt: StageProfile,
    pub tts: StageProfile,
    pub usage: UsageSignalConfig,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            duration_s: 30.0,
            seed: 42,
            sessions: 4,
            audio_min_ms: 2_000,
            audio_max_ms: 15_000,
            utterance_gap_ms: 500,
            asr: StageProfile {
                priority: 90,
                max_wait_ms: 1_500,
                busy_policy: BusyPolicy::Wait,
                hold_per_audio_s_ms: 60,
            },
            nmt: StageProfile {
                priority: 70,
                max_wait_ms: 1_000,
                busy_policy: BusyPolicy::FallbackCpu,
                hold_per_audio_s_ms: 20,
            },
            tts: StageProfile {
                priority: 50,
                max_wait_ms: 2_000,
                busy_policy: BusyPolicy::FallbackCpu,
                hold_per_audio_s_ms: 40,
            },
            usage: UsageSignalConfig::default(),
        }
    }
}

impl WorkloadConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_s)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.duration_s > 0.0) {
            bail!("duration_s must be positive");
        }
        if self.sessions == 0 {
            bail!("at least one session is required");
        }
        if self.audio_min_ms > self.audio_max_ms {
            bail!(
                "audio_min_ms ({}) must not exceed audio_max_ms ({})",
                self.audio_min_ms,
                self.audio_max_ms
            );
        }
        if !(self.usage.period_s > 0.0) {
            bail!("usage.period_s must be positive");
        }
        for (name, stage) in [("asr", &self.asr), ("nmt", &self.nmt), ("tts", &self.tts)] {
            if stage.priority > 100 {
                bail!("{} priority must be at most 100", name);
            }
        }
        Ok(())
    }

    fn stages(&self) -> [(TaskType, &StageProfile); 3] {
        [
            (TaskType::Asr, &self.asr),
            (TaskType::Nmt, &self.nmt),
            (TaskType::Tts, &self.tts),
        ]
    }
}

/// Sampler producing the synthetic utilization signal
pub struct SyntheticUsageSampler {
    config: UsageSignalConfig,
    started: Instant,
    rng: Mutex<StdRng>,
}

impl SyntheticUsageSampler {
    pub fn new(config: UsageSignalConfig, seed: u64) -> Self {
        Self {
            config,
            started: Instant::now(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn usage_at(&self, elapsed_s: f64) -> f64 {
        let phase = 2.0 * std::f64::consts::PI * elapsed_s / self.config.period_s;
        let noise = if self.config.noise > 0.0 {
            self.rng
                .lock()
                .gen_range(-self.config.noise..=self.config.noise)
        } else {
            0.0
        };
        (self.config.baseline + self.config.amplitude * phase.sin() + noise).clamp(0.0, 100.0)
    }
}

#[async_trait]
impl UsageSampler for SyntheticUsageSampler {
    async fn sample(&self) -> gpu_arbiter::Result<GpuUsageReading> {
        let usage = self.usage_at(self.started.elapsed().as_secs_f64());
        Ok(GpuUsageReading::new(usage, usage * 0.8))
    }
}

/// Outcome counts for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub acquired: u64,
    pub timeout: u64,
    pub fallback_cpu: u64,
    pub skipped: u64,
}

impl StageCounts {
    fn record(&mut self, outcome: &AcquireOutcome) {
        match outcome {
            AcquireOutcome::Acquired { .. } => self.acquired += 1,
            AcquireOutcome::Timeout { .. } => self.timeout += 1,
            AcquireOutcome::FallbackCpu { .. } => self.fallback_cpu += 1,
            AcquireOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: &StageCounts) {
        self.acquired += other.acquired;
        self.timeout += other.timeout;
        self.fallback_cpu += other.fallback_cpu;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> u64 {
        self.acquired + self.timeout + self.fallback_cpu + self.skipped
    }
}

/// Per-stage outcome counts for a workload run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub utterances: u64,
    pub asr: StageCounts,
    pub nmt: StageCounts,
    pub tts: StageCounts,
}

impl WorkloadReport {
    fn stage_mut(&mut self, task_type: TaskType) -> &mut StageCounts {
        match task_type {
            TaskType::Asr => &mut self.asr,
            TaskType::Nmt => &mut self.nmt,
            TaskType::Tts => &mut self.tts,
        }
    }

    fn merge(&mut self, other: &WorkloadReport) {
        self.utterances += other.utterances;
        self.asr.merge(&other.asr);
        self.nmt.merge(&other.nmt);
        self.tts.merge(&other.tts);
    }

    pub fn total_acquired(&self) -> u64 {
        self.asr.acquired + self.nmt.acquired + self.tts.acquired
    }
}

/// Run every session against the arbiter until the configured duration elapses
pub async fn run_workload(arbiter: &Arbiter, config: &WorkloadConfig) -> Result<WorkloadReport> {
    let keys = arbiter.resource_keys();
    if keys.is_empty() {
        bail!("arbiter has no resource keys");
    }

    info!(
        "Running {} session(s) for {:.1}s across {} resource(s)",
        config.sessions,
        config.duration_s,
        keys.len()
    );
    let ends_at = Instant::now() + config.duration();

    let handles: Vec<_> = (0..config.sessions)
        .map(|index| {
            let arbiter = arbiter.clone();
            let config = config.clone();
            let key = keys[index % keys.len()].clone();
            tokio::spawn(async move { run_session(arbiter, config, key, index as u64, ends_at).await })
        })
        .collect();

    let mut report = WorkloadReport::default();
    for handle in handles {
        report.merge(&handle.await??);
    }

    info!(
        "Workload finished: {} utterances, {} GPU leases",
        report.utterances,
        report.total_acquired()
    );
    Ok(report)
}

async fn run_session(
    arbiter: Arbiter,
    config: WorkloadConfig,
    key: ResourceKey,
    index: u64,
    ends_at: Instant,
) -> Result<WorkloadReport> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index));
    let session_id = Uuid::new_v4().to_string();
    let mut report = WorkloadReport::default();

    while Instant::now() < ends_at {
        let audio_ms = rng.gen_range(config.audio_min_ms..=config.audio_max_ms);
        let trace = TraceContext::new()
            .with("session_id", session_id.as_str())
            .with("job_id", Uuid::new_v4().to_string());
        report.utterances += 1;

        arbiter.notify_task_hint(
            &key,
            TaskHint {
                estimated_duration_ms: audio_ms,
                estimated_hold_ms: config.asr.hold_for(audio_ms).as_millis() as u64,
            },
        )?;

        for (task_type, profile) in config.stages() {
            let request = AcquireRequest::new(key.clone(), task_type)
                .with_priority(profile.priority)
                .with_max_wait(Duration::from_millis(profile.max_wait_ms))
                .with_busy_policy(profile.busy_policy)
                .with_trace(trace.clone());

            let outcome = arbiter.acquire(request).await?;
            report.stage_mut(task_type).record(&outcome);

            match outcome.lease_id() {
                Some(lease_id) => {
                    tokio::time::sleep(profile.hold_for(audio_ms)).await;
                    arbiter.release(lease_id);
                }
                // Without a transcript there is nothing to translate
                None if task_type == TaskType::Asr => {
                    debug!("Dropping utterance after ASR {} ({})", outcome.status(), trace);
                    break;
                }
                None => debug!("{} {} ({})", task_type, outcome.status(), trace),
            }
        }

        tokio::time::sleep(Duration::from_millis(config.utterance_gap_ms)).await;
    }

    Ok(report)
}
