//! End-to-end admission, queueing and release behaviour

use gpu_arbiter::{
    AcquireOutcome, AcquireRequest, AdmissionState, Arbiter, ArbiterConfig, ArbiterError,
    ArbiterPrometheusMetrics, BusyPolicy, MockUsageSampler, ResourceKey, TaskHint, TaskType,
    TraceContext,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn gpu0() -> ResourceKey {
    ResourceKey::new("gpu0")
}

fn setup(config: ArbiterConfig) -> (Arbiter, MockUsageSampler) {
    let sampler = MockUsageSampler::new(40.0);
    let arbiter = Arbiter::new(config, Arc::new(sampler.clone())).unwrap();
    (arbiter, sampler)
}

fn default_setup() -> (Arbiter, MockUsageSampler) {
    setup(ArbiterConfig::new(vec![gpu0(), ResourceKey::new("gpu1")]))
}

/// Drive both the sampler and the cached state to a usage level
async fn set_usage(arbiter: &Arbiter, sampler: &MockUsageSampler, usage: f64) {
    sampler.set_usage(usage);
    arbiter.usage_monitor().sample_now().await;
}

fn request(task_type: TaskType, priority: u8, max_wait_ms: u64) -> AcquireRequest {
    AcquireRequest::new("gpu0", task_type)
        .with_priority(priority)
        .with_max_wait(Duration::from_millis(max_wait_ms))
}

async fn hold(arbiter: &Arbiter) -> gpu_arbiter::LeaseId {
    arbiter
        .acquire(request(TaskType::Asr, 50, 1_000))
        .await
        .unwrap()
        .lease_id()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion() {
    let (arbiter, _sampler) = default_setup();
    let first = hold(&arbiter).await;

    let second = arbiter.acquire(request(TaskType::Nmt, 95, 200));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert_eq!(snapshot.lease.as_ref().map(|l| l.lease_id), Some(first));
    assert_eq!(snapshot.queue.len(), 1);
    assert_eq!(arbiter.active_leases().len(), 1);

    let outcome = second.await.unwrap();
    assert_eq!(outcome.status(), "SKIPPED");

    // Other keys are independent
    let other = arbiter
        .acquire(AcquireRequest::new("gpu1", TaskType::Tts))
        .await
        .unwrap();
    assert!(other.is_acquired());
    assert_eq!(arbiter.active_leases().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_fairness_ignores_priority() {
    let (arbiter, _sampler) = default_setup();
    let holder = hold(&arbiter).await;

    let waiters: Vec<_> = [10u8, 99, 50, 70]
        .into_iter()
        .map(|priority| {
            let arbiter = arbiter.clone();
            let fut = arbiter.acquire(request(TaskType::Nmt, priority, 5_000));
            tokio::spawn(fut)
        })
        .collect();

    let queued: Vec<u8> = arbiter
        .snapshot(&gpu0())
        .unwrap()
        .queue
        .iter()
        .map(|entry| entry.priority)
        .collect();
    assert_eq!(queued, vec![10, 99, 50, 70]);

    arbiter.release(holder);
    let mut served = Vec::new();
    for waiter in waiters {
        let outcome = waiter.await.unwrap().unwrap();
        let lease_id = outcome.lease_id().unwrap();
        served.push(lease_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        arbiter.release(lease_id);
    }

    let mut sorted = served.clone();
    sorted.sort();
    assert_eq!(served, sorted, "leases must be served in arrival order");
}

#[tokio::test(start_paused = true)]
async fn test_skipped_after_wait_budget() {
    let (arbiter, _sampler) = default_setup();
    let _holder = hold(&arbiter).await;

    let start = Instant::now();
    let outcome = arbiter
        .acquire(request(TaskType::Nmt, 50, 100))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(matches!(outcome, AcquireOutcome::Skipped { .. }));
    assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(110));

    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert!(snapshot.queue.is_empty());
    assert_eq!(snapshot.metrics.skipped, 1);
    assert_eq!(snapshot.metrics.timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_acquires_after_release() {
    let (arbiter, _sampler) = default_setup();
    let first = hold(&arbiter).await;

    let waiter = tokio::spawn(arbiter.acquire(request(TaskType::Tts, 50, 5_000)));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(arbiter.release(first));

    match waiter.await.unwrap().unwrap() {
        AcquireOutcome::Acquired { queue_wait_ms, .. } => assert!(queue_wait_ms >= 250),
        other => panic!("expected a lease, got {:?}", other),
    }

    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert!(snapshot.queue.is_empty());
    assert_eq!(snapshot.metrics.acquired, 2);
    assert_eq!(snapshot.metrics.recent_queue_wait_ms, vec![250]);
    assert_eq!(snapshot.metrics.recent_hold_ms, vec![250]);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_policy_on_busy_resource() {
    let (arbiter, _sampler) = default_setup();
    let _holder = hold(&arbiter).await;

    let outcome = arbiter
        .acquire(request(TaskType::Tts, 30, 100).with_busy_policy(BusyPolicy::FallbackCpu))
        .await
        .unwrap();
    assert!(matches!(outcome, AcquireOutcome::FallbackCpu { .. }));
    assert_eq!(arbiter.snapshot(&gpu0()).unwrap().metrics.fallback_cpu, 1);
}

#[tokio::test(start_paused = true)]
async fn test_low_priority_is_enqueued_under_pressure() {
    let (arbiter, sampler) = default_setup();
    set_usage(&arbiter, &sampler, 92.0).await;
    assert_eq!(
        arbiter.usage_monitor().admission_state(&gpu0()),
        AdmissionState::HighPressure
    );

    // Resource is free, yet a low priority request must wait
    let low = tokio::spawn(arbiter.acquire(request(TaskType::Nmt, 40, 5_000)));
    tokio::task::yield_now().await;
    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert!(snapshot.lease.is_none());
    assert_eq!(snapshot.queue.len(), 1);

    // High priority is granted while free
    let high = arbiter
        .acquire(
            AcquireRequest::new("gpu0", TaskType::Tts)
                .with_priority(75)
                .with_max_wait(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(high.is_acquired());
    arbiter.release(high.lease_id().unwrap());

    // Recovery drains the queue
    set_usage(&arbiter, &sampler, 60.0).await;
    let outcome = low.await.unwrap().unwrap();
    assert!(outcome.is_acquired());
}

#[tokio::test(start_paused = true)]
async fn test_critical_task_bypasses_pressure_on_idle_resource() {
    let (arbiter, sampler) = default_setup();
    set_usage(&arbiter, &sampler, 95.0).await;

    let critical = arbiter
        .acquire(request(TaskType::Asr, 95, 1_000))
        .await
        .unwrap();
    assert!(matches!(
        critical,
        AcquireOutcome::Acquired { queue_wait_ms: 0, .. }
    ));
    arbiter.release(critical.lease_id().unwrap());

    // Same free resource and pressure, but a non-critical stage below 70 waits
    let nmt = tokio::spawn(arbiter.acquire(
        request(TaskType::Nmt, 65, 200).with_busy_policy(BusyPolicy::FallbackCpu),
    ));
    tokio::task::yield_now().await;
    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert!(snapshot.lease.is_none());
    assert_eq!(snapshot.queue.len(), 1);

    let outcome = nmt.await.unwrap().unwrap();
    assert!(matches!(outcome, AcquireOutcome::FallbackCpu { .. }));
    assert_eq!(arbiter.snapshot(&gpu0()).unwrap().metrics.acquired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_times_out_under_pressure() {
    let (arbiter, sampler) = default_setup();
    let _holder = hold(&arbiter).await;
    set_usage(&arbiter, &sampler, 95.0).await;

    let outcome = arbiter
        .acquire(
            request(TaskType::Asr, 80, 150).with_busy_policy(BusyPolicy::FallbackCpu),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, AcquireOutcome::Timeout { .. }));

    let metrics = arbiter.snapshot(&gpu0()).unwrap().metrics;
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.fallback_cpu, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_limit_is_a_signal_not_a_rejection() {
    let (arbiter, _sampler) = default_setup();
    let _holder = hold(&arbiter).await;

    let waiters: Vec<_> = (0..3)
        .map(|_| tokio::spawn(arbiter.acquire(request(TaskType::Nmt, 50, 100).with_queue_limit(1))))
        .collect();

    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert_eq!(snapshot.queue.len(), 3);
    assert_eq!(snapshot.metrics.queue_full, 2);

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap().status(), "SKIPPED");
    }
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_flags_but_keeps_lease() {
    let (arbiter, _sampler) = default_setup();
    let lease_id = arbiter
        .acquire(
            AcquireRequest::new("gpu0", TaskType::Asr)
                .with_hold_max(Duration::from_millis(500))
                .with_trace(TraceContext::new().with("job_id", "job-1")),
        )
        .await
        .unwrap()
        .lease_id()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;

    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    let lease = snapshot.lease.expect("lease must survive the watchdog");
    assert_eq!(lease.lease_id, lease_id);
    assert!(lease.watchdog_fired);
    assert_eq!(lease.trace.as_ref().and_then(|t| t.get("job_id")), Some("job-1"));
    assert_eq!(snapshot.metrics.watchdog_violations, 1);

    assert!(arbiter.release(lease_id));
    assert!(arbiter.snapshot(&gpu0()).unwrap().lease.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_released_lease_never_trips_watchdog() {
    let (arbiter, _sampler) = default_setup();
    let lease_id = arbiter
        .acquire(AcquireRequest::new("gpu0", TaskType::Asr).with_hold_max(Duration::from_millis(200)))
        .await
        .unwrap()
        .lease_id()
        .unwrap();
    arbiter.release(lease_id);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(arbiter.snapshot(&gpu0()).unwrap().metrics.watchdog_violations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_double_and_unknown_release_are_noops() {
    let (arbiter, _sampler) = default_setup();
    let lease_id = hold(&arbiter).await;

    assert!(arbiter.release(lease_id));
    assert!(!arbiter.release(lease_id));

    let other = hold(&arbiter).await;
    assert!(!arbiter.release(lease_id));
    assert_eq!(arbiter.active_leases()[0].lease_id, other);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_key_is_an_error() {
    let (arbiter, _sampler) = default_setup();
    let result = arbiter
        .acquire(AcquireRequest::new("gpu7", TaskType::Asr))
        .await;
    match result {
        Err(ArbiterError::UnknownResourceKey(key)) => assert_eq!(key.as_str(), "gpu7"),
        other => panic!("expected unknown key error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_request_does_not_orphan_lease() {
    let (arbiter, _sampler) = default_setup();
    let holder = hold(&arbiter).await;

    let abandoned = arbiter.acquire(request(TaskType::Nmt, 50, 5_000));
    let waiter = tokio::spawn(arbiter.acquire(request(TaskType::Tts, 50, 5_000)));
    drop(abandoned);

    arbiter.release(holder);
    let outcome = waiter.await.unwrap().unwrap();
    assert!(outcome.is_acquired());

    let leases = arbiter.active_leases();
    assert_eq!(leases.len(), 1);
    assert_eq!(Some(leases[0].lease_id), outcome.lease_id());

    // the dropped request never counts as a grant
    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert!(snapshot.queue.is_empty());
    assert_eq!(snapshot.metrics.acquired, 2);
    assert_eq!(snapshot.metrics.recent_queue_wait_ms.len(), 1);
    assert_eq!(snapshot.metrics.recent_hold_ms.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bypass_mode_grants_concurrently() {
    let (arbiter, _sampler) = setup(ArbiterConfig::new(vec![gpu0()]).with_enabled(false));

    let a = hold(&arbiter).await;
    let b = hold(&arbiter).await;
    assert_ne!(a, b);
    assert!(arbiter.active_leases().is_empty());
    assert_eq!(arbiter.snapshot(&gpu0()).unwrap().metrics.acquired, 0);
}

#[tokio::test(start_paused = true)]
async fn test_task_hint_raises_thresholds() {
    let (arbiter, sampler) = default_setup();
    arbiter
        .notify_task_hint(
            &gpu0(),
            TaskHint {
                estimated_duration_ms: 20_000,
                estimated_hold_ms: 4_000,
            },
        )
        .unwrap();

    set_usage(&arbiter, &sampler, 87.0).await;
    let snapshot = arbiter.snapshot(&gpu0()).unwrap();
    assert_eq!(snapshot.admission_state, AdmissionState::Normal);
    assert_eq!(snapshot.thresholds.high_water, 90.0);
    assert_eq!(snapshot.gpu_usage_percent, Some(87.0));

    // The hint is per key
    assert_eq!(
        arbiter.snapshot(&ResourceKey::new("gpu1")).unwrap().admission_state,
        AdmissionState::HighPressure
    );
}

#[tokio::test(start_paused = true)]
async fn test_periodic_sampling_drives_state() {
    let (arbiter, sampler) = default_setup();
    sampler.set_usage(90.0);
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(
        arbiter.usage_monitor().admission_state(&gpu0()),
        AdmissionState::HighPressure
    );

    sampler.set_usage(50.0);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        arbiter.usage_monitor().admission_state(&gpu0()),
        AdmissionState::Normal
    );
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_export_to_prometheus() {
    let (arbiter, _sampler) = default_setup();
    let _lease = hold(&arbiter).await;

    let exporter = ArbiterPrometheusMetrics::new().unwrap();
    for snapshot in arbiter.snapshots() {
        exporter.update_from_snapshot(&snapshot);
    }

    let text = exporter.render().unwrap();
    assert!(text.contains("gpu_arbiter_lease_held{resource_key=\"gpu0\"} 1"));
    assert!(text.contains("gpu_arbiter_lease_held{resource_key=\"gpu1\"} 0"));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_serializes_to_json() {
    let (arbiter, _sampler) = default_setup();
    let _lease = hold(&arbiter).await;

    let json = serde_json::to_value(arbiter.snapshot(&gpu0()).unwrap()).unwrap();
    assert_eq!(json["resource_key"], "gpu0");
    assert_eq!(json["admission_state"], "NORMAL");
    assert_eq!(json["lease"]["task_type"], "asr");
}
