//! Per-resource FIFO wait queues
//!
//! Each waiting request owns a one-shot resolver and a [`Deadline`]. An entry
//! leaves its queue exactly once, either popped by [`QueueManager::process_queue`]
//! and granted, or removed by its deadline. Removal happens under the queue
//! lock, so whoever removes the entry is the only party that resolves it.

use crate::deadline::Deadline;
use crate::metrics::MetricsManager;
use crate::types::{
    AcquireOutcome, AcquireRequest, AdmissionState, BusyPolicy, LeaseId, ResourceKey, TaskType,
};
use crate::{ArbiterError, Result};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

/// Grant path used when draining a queue.
///
/// Implemented over a locked lease slot, so every call observes and mutates
/// the same slot state for the duration of one drain.
pub trait GrantSink {
    /// Whether the resource currently has a lease
    fn is_locked(&self) -> bool;

    /// Whether the current admission state lets this request be served
    fn admits(&self, request: &AcquireRequest) -> bool;

    /// Install a lease for a dequeued request
    fn grant(&mut self, lease_id: LeaseId, request: &AcquireRequest, queue_wait: Duration) -> AcquireOutcome;

    /// Undo a grant whose caller is gone
    fn revoke_abandoned(&mut self, lease_id: LeaseId);
}

/// What a queue deadline needs from its owner
pub trait QueueContext: Send + Sync {
    /// Admission state used to pick the deadline outcome
    fn admission_state(&self, key: &ResourceKey) -> AdmissionState;

    /// Drain the queue after an entry left it
    fn drain(&self, key: &ResourceKey);
}

/// Read-only view of a waiting request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntryView {
    pub lease_id: LeaseId,
    pub task_type: TaskType,
    pub priority: u8,
    pub current_wait_ms: u64,
}

struct PendingRequest {
    lease_id: LeaseId,
    request: AcquireRequest,
    enqueued_at: Instant,
    deadline: Deadline,
    resolver: oneshot::Sender<AcquireOutcome>,
}

type Queue = Arc<Mutex<VecDeque<PendingRequest>>>;

/// Outcome for a request whose wait budget ran out
pub fn deadline_outcome(request: &AcquireRequest, state: AdmissionState, waited: Duration) -> AcquireOutcome {
    let waited_ms = waited.as_millis();
    if state == AdmissionState::HighPressure && request.is_high_priority() {
        return AcquireOutcome::Timeout {
            reason: format!("waited {}ms under high GPU pressure", waited_ms),
        };
    }
    match request.busy_policy {
        BusyPolicy::FallbackCpu => AcquireOutcome::FallbackCpu {
            reason: format!("GPU busy for {}ms, falling back to CPU", waited_ms),
        },
        BusyPolicy::Wait => AcquireOutcome::Skipped {
            reason: format!("GPU busy for {}ms", waited_ms),
        },
    }
}

/// FIFO wait queues for a fixed set of resource keys
pub struct QueueManager {
    queues: HashMap<ResourceKey, Queue>,
    metrics: MetricsManager,
    context: Weak<dyn QueueContext>,
    runtime: Handle,
}

impl QueueManager {
    pub fn new(
        resource_keys: &[ResourceKey],
        metrics: MetricsManager,
        context: Weak<dyn QueueContext>,
        runtime: Handle,
    ) -> Self {
        let queues = resource_keys
            .iter()
            .map(|key| (key.clone(), Arc::new(Mutex::new(VecDeque::new()))))
            .collect();

        Self {
            queues,
            metrics,
            context,
            runtime,
        }
    }

    fn queue(&self, key: &ResourceKey) -> Result<&Queue> {
        self.queues
            .get(key)
            .ok_or_else(|| ArbiterError::UnknownResourceKey(key.clone()))
    }

    /// Append a request to the tail and arm its deadline
    pub fn enqueue_request(
        &self,
        key: &ResourceKey,
        request: AcquireRequest,
        lease_id: LeaseId,
    ) -> Result<oneshot::Receiver<AcquireOutcome>> {
        let queue = self.queue(key)?;
        let (resolver, receiver) = oneshot::channel();

        let deadline = {
            let queue = Arc::clone(queue);
            let metrics = self.metrics.clone();
            let context = self.context.clone();
            let key = key.clone();
            Deadline::arm(&self.runtime, request.max_wait, move || {
                expire(&queue, &metrics, &context, &key, lease_id)
            })
        };

        let mut entries = queue.lock();
        debug!(
            "Queued {} ({}, priority {}) on {} at position {} {}",
            lease_id,
            request.task_type,
            request.priority,
            key,
            entries.len(),
            request.trace_label()
        );
        entries.push_back(PendingRequest {
            lease_id,
            request,
            enqueued_at: Instant::now(),
            deadline,
            resolver,
        });

        Ok(receiver)
    }

    /// Serve the head of the queue while the resource is free and admits it
    pub fn process_queue(&self, key: &ResourceKey, sink: &mut impl GrantSink) {
        let Ok(queue) = self.queue(key) else {
            return;
        };

        loop {
            if sink.is_locked() {
                return;
            }

            let entry = {
                let mut entries = queue.lock();
                let Some(head) = entries.front() else {
                    return;
                };
                if !sink.admits(&head.request) {
                    debug!("Head {} of {} held back by admission state", head.lease_id, key);
                    return;
                }
                entries.pop_front()
            };
            let Some(entry) = entry else {
                return;
            };

            entry.deadline.cancel();
            if entry.resolver.is_closed() {
                info!("Caller for {} on {} went away, skipping", entry.lease_id, key);
                continue;
            }

            let waited = entry.enqueued_at.elapsed();
            let outcome = sink.grant(entry.lease_id, &entry.request, waited);
            if entry.resolver.send(outcome).is_err() {
                info!("Caller for {} on {} went away, rolling back grant", entry.lease_id, key);
                sink.revoke_abandoned(entry.lease_id);
                continue;
            }

            // Counted only once the caller holds the lease
            self.metrics.record_acquired(key);
            self.metrics.record_queue_wait(key, waited);
            info!(
                "Granted {} on {} to {} (priority {}, waited {}ms) {}",
                entry.lease_id,
                key,
                entry.request.task_type,
                entry.request.priority,
                waited.as_millis(),
                entry.request.trace_label()
            );
        }
    }

    /// Waiting entries in service order
    pub fn queue_snapshot(&self, key: &ResourceKey) -> Vec<QueueEntryView> {
        let Ok(queue) = self.queue(key) else {
            return Vec::new();
        };

        queue
            .lock()
            .iter()
            .map(|entry| QueueEntryView {
                lease_id: entry.lease_id,
                task_type: entry.request.task_type,
                priority: entry.request.priority,
                current_wait_ms: entry.enqueued_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    pub fn queue_len(&self, key: &ResourceKey) -> usize {
        self.queue(key).map(|queue| queue.lock().len()).unwrap_or(0)
    }
}

fn expire(
    queue: &Queue,
    metrics: &MetricsManager,
    context: &Weak<dyn QueueContext>,
    key: &ResourceKey,
    lease_id: LeaseId,
) {
    let entry = {
        let mut entries = queue.lock();
        match entries.iter().position(|entry| entry.lease_id == lease_id) {
            Some(index) => entries.remove(index),
            None => None,
        }
    };
    // Already dequeued and granted
    let Some(entry) = entry else {
        return;
    };

    let context = context.upgrade();
    let state = context
        .as_ref()
        .map(|ctx| ctx.admission_state(key))
        .unwrap_or_default();
    let waited = entry.enqueued_at.elapsed();
    let outcome = deadline_outcome(&entry.request, state, waited);

    metrics.record_timeout(key);
    match &outcome {
        AcquireOutcome::FallbackCpu { .. } => metrics.record_fallback_cpu(key),
        AcquireOutcome::Skipped { .. } => metrics.record_skipped(key),
        _ => {}
    }

    info!(
        "{} on {} resolved {} after {}ms ({}) {}",
        lease_id,
        key,
        outcome.status(),
        waited.as_millis(),
        state,
        entry.request.trace_label()
    );
    let _ = entry.resolver.send(outcome);

    if let Some(ctx) = context {
        ctx.drain(key);
    }
}
