// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Deduplicating, retry-aware work queue scheduler.
//!
//! Change notifications from the watch multiplexer land here as per-key
//! reconcile requests. The scheduler guarantees:
//!
//! - at most one in-flight reconcile per key, process-wide: an enqueue for a
//!   key currently being processed marks it dirty and it is reprocessed once
//!   the current attempt finishes, never run concurrently
//! - no entry is ever silently dropped: every enqueue merges into an existing
//!   pending entry or creates a new one, and failures re-enqueue with backoff
//! - retries are unbounded, with per-key exponential backoff capped at a
//!   maximum delay and reset on the first non-error result
//!
//! Workers dequeue only while this instance holds leadership; work already in
//! flight when leadership is lost runs to completion but its outcome is
//! discarded after a leadership re-check.

use crate::constants::{
    BACKOFF_MULTIPLIER, DRAIN_TIMEOUT_SECS, QUEUE_BASE_DELAY_MILLIS, QUEUE_MAX_DELAY_SECS,
    RANDOMIZATION_FACTOR, SCHEDULER_STALL_THRESHOLD_SECS,
};
use crate::crd::ObjectKey;
use crate::dispatch::Dispatch;
use crate::leader::LeaderState;
use crate::metrics::Metrics;
use crate::reconcilers::Action;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a key was enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeReason {
    /// Object appeared in the watch stream or a relist
    Created,
    /// Object changed
    Updated,
    /// Object disappeared
    Deleted,
    /// Timer-driven re-insertion (requeue-after, periodic resync)
    Resync,
}

impl ChangeReason {
    /// Merge with a newer reason for the same pending key. A real change
    /// always wins over a timer-driven resync; otherwise the newer reason
    /// wins, which coalesces rapid repeated updates into one `Updated` entry.
    #[must_use]
    pub fn merge(self, newer: ChangeReason) -> ChangeReason {
        match newer {
            ChangeReason::Resync => self,
            _ => newer,
        }
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeReason::Created => "created",
            ChangeReason::Updated => "updated",
            ChangeReason::Deleted => "deleted",
            ChangeReason::Resync => "resync",
        }
    }
}

/// One unit of work handed to a reconcile worker.
///
/// Exists only inside the queue and while a worker processes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileRequest {
    /// Key of the object to reconcile
    pub key: ObjectKey,
    /// Why the key was enqueued
    pub reason: ChangeReason,
    /// Number of consecutive failed attempts preceding this one
    pub attempts: u32,
}

/// Tunable scheduler behavior.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// First retry delay after a failure
    pub base_delay: Duration,
    /// Upper bound on retry delays
    pub max_delay: Duration,
    /// Exponential growth factor between retries
    pub multiplier: f64,
    /// Randomization factor applied to retry delays (0.0 disables jitter)
    pub jitter: f64,
    /// How long in-flight workers may run after shutdown is requested
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(QUEUE_BASE_DELAY_MILLIS),
            max_delay: Duration::from_secs(QUEUE_MAX_DELAY_SECS),
            multiplier: BACKOFF_MULTIPLIER,
            jitter: RANDOMIZATION_FACTOR,
            drain_timeout: Duration::from_secs(DRAIN_TIMEOUT_SECS),
        }
    }
}

#[derive(Default)]
struct QueueState {
    fifo: VecDeque<ObjectKey>,
    pending: HashMap<ObjectKey, ChangeReason>,
    processing: HashSet<ObjectKey>,
    dirty: HashMap<ObjectKey, ChangeReason>,
    attempts: HashMap<ObjectKey, u32>,
}

/// Event-driven work queue with a bounded pool of reconcile workers.
pub struct Scheduler {
    state: Mutex<QueueState>,
    notify: Notify,
    config: SchedulerConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    heartbeat: Mutex<Instant>,
}

impl Scheduler {
    /// Build a scheduler. The cancellation token is shared with the manager
    /// so timer-based re-insertions die with the process.
    #[must_use]
    pub fn new(config: SchedulerConfig, metrics: Arc<Metrics>, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
            metrics,
            cancel,
            heartbeat: Mutex::new(Instant::now()),
        }
    }

    /// Add a key to the queue, merging with any pending or in-flight entry
    /// for the same key.
    pub fn enqueue(&self, key: ObjectKey, reason: ChangeReason) {
        let mut state = self.state.lock().expect("queue state poisoned");

        if state.processing.contains(&key) {
            // Reprocess after the current attempt finishes; never run the
            // same key concurrently.
            let merged = state
                .dirty
                .get(&key)
                .copied()
                .map_or(reason, |d| d.merge(reason));
            state.dirty.insert(key, merged);
            return;
        }

        if let Some(existing) = state.pending.get_mut(&key) {
            *existing = existing.merge(reason);
            return;
        }

        state.pending.insert(key.clone(), reason);
        state.fifo.push_back(key);
        self.metrics.queue_depth.set(state.fifo.len() as i64);
        drop(state);
        self.notify.notify_one();
    }

    /// Re-insert a key after a delay. The timer dies with the scheduler.
    pub fn enqueue_after(self: &Arc<Self>, key: ObjectKey, reason: ChangeReason, delay: Duration) {
        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => scheduler.enqueue(key, reason),
            }
        });
    }

    /// Number of keys currently waiting (excludes in-flight keys).
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.state.lock().expect("queue state poisoned").fifo.len()
    }

    /// Whether the watchdog heartbeat is older than the given threshold;
    /// feeds the liveness probe.
    #[must_use]
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.heartbeat
            .lock()
            .expect("heartbeat poisoned")
            .elapsed()
            > threshold
    }

    /// Run `worker_count` reconcile workers plus the watchdog until
    /// cancelled, then drain in-flight work within the configured window.
    pub async fn run(
        self: Arc<Self>,
        worker_count: usize,
        dispatcher: Arc<dyn Dispatch>,
        leadership: watch::Receiver<LeaderState>,
        cancel: CancellationToken,
    ) {
        info!(workers = worker_count, "Starting work queue scheduler");

        let mut tasks = JoinSet::new();
        for worker_id in 0..worker_count {
            let scheduler = Arc::clone(&self);
            let dispatcher = Arc::clone(&dispatcher);
            let leadership = leadership.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                scheduler
                    .worker_loop(worker_id, dispatcher, leadership, cancel)
                    .await;
            });
        }
        {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { scheduler.watchdog_loop(cancel).await });
        }

        cancel.cancelled().await;

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Drain window elapsed, aborting in-flight workers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("Work queue scheduler stopped");
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        dispatcher: Arc<dyn Dispatch>,
        mut leadership: watch::Receiver<LeaderState>,
        cancel: CancellationToken,
    ) {
        debug!(worker = worker_id, "Reconcile worker started");
        loop {
            let Some(request) = self.next_request(&mut leadership, &cancel).await else {
                break;
            };

            debug!(
                worker = worker_id,
                key = %request.key,
                reason = request.reason.as_str(),
                attempts = request.attempts,
                "Dispatching reconcile"
            );

            let started = Instant::now();
            let result = dispatcher.dispatch(&request).await;
            let duration = started.elapsed();

            // Leadership may have moved while we were reconciling; re-check
            // before any state-mutating follow-up.
            let still_leading = *leadership.borrow() == LeaderState::Leading;
            self.complete(request, result, duration, still_leading);
        }
        debug!(worker = worker_id, "Reconcile worker stopped");
    }

    /// Block until a request is available while this instance leads, or
    /// return `None` on shutdown.
    async fn next_request(
        &self,
        leadership: &mut watch::Receiver<LeaderState>,
        cancel: &CancellationToken,
    ) -> Option<ReconcileRequest> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // Workers stop accepting new work as soon as leadership is lost.
            while *leadership.borrow() != LeaderState::Leading {
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }

            // Register for wakeups before checking the queue, so an enqueue
            // racing with this check is never missed.
            let notified = self.notify.notified();
            if let Some(request) = self.try_dequeue() {
                return Some(request);
            }

            tokio::select! {
                () = cancel.cancelled() => return None,
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                () = notified => {}
            }
        }
    }

    fn try_dequeue(&self) -> Option<ReconcileRequest> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let key = state.fifo.pop_front()?;
        let reason = state
            .pending
            .remove(&key)
            .unwrap_or(ChangeReason::Resync);
        let attempts = state.attempts.get(&key).copied().unwrap_or(0);
        state.processing.insert(key.clone());
        self.metrics.queue_depth.set(state.fifo.len() as i64);
        Some(ReconcileRequest {
            key,
            reason,
            attempts,
        })
    }

    /// Act on a finished reconcile. Results observed after leadership was
    /// lost are discarded; the next leader relists and rebuilds the queue.
    fn complete(
        self: &Arc<Self>,
        request: ReconcileRequest,
        result: Result<Action, crate::reconcilers::ReconcileError>,
        duration: Duration,
        still_leading: bool,
    ) {
        let key = request.key;
        let kind = key.kind.kind.clone();

        let dirty_reason = {
            let mut state = self.state.lock().expect("queue state poisoned");
            state.processing.remove(&key);
            state.dirty.remove(&key)
        };

        if !still_leading {
            debug!(key = %key, "Leadership lost mid-flight, discarding reconcile result");
            self.metrics
                .observe_reconciliation(&kind, "discarded", duration);
            return;
        }

        match result {
            Ok(Action::Done) => {
                self.metrics.observe_reconciliation(&kind, "done", duration);
                self.reset_backoff(&key);
                if let Some(reason) = dirty_reason {
                    self.metrics
                        .requeues_total
                        .with_label_values(&[kind.as_str(), "dirty"])
                        .inc();
                    self.enqueue(key, reason);
                }
            }
            Ok(Action::RequeueAfter(delay)) => {
                self.metrics
                    .observe_reconciliation(&kind, "requeue_after", duration);
                self.reset_backoff(&key);
                self.metrics
                    .requeues_total
                    .with_label_values(&[kind.as_str(), "requeue_after"])
                    .inc();
                if let Some(reason) = dirty_reason {
                    // A change arrived while we were reconciling; reprocess
                    // now, the timer would only delay convergence.
                    self.enqueue(key, reason);
                } else {
                    self.enqueue_after(key, ChangeReason::Resync, delay);
                }
            }
            Ok(Action::Requeue) => {
                self.metrics
                    .observe_reconciliation(&kind, "requeue", duration);
                self.reset_backoff(&key);
                self.metrics
                    .requeues_total
                    .with_label_values(&[kind.as_str(), "requeue"])
                    .inc();
                self.enqueue(key, dirty_reason.unwrap_or(ChangeReason::Resync));
            }
            Err(err) => {
                let attempts = {
                    let mut state = self.state.lock().expect("queue state poisoned");
                    let attempts = state.attempts.entry(key.clone()).or_insert(0);
                    *attempts += 1;
                    *attempts
                };
                let delay = self.backoff_delay(attempts);
                warn!(
                    key = %key,
                    error = %err,
                    attempt = attempts,
                    retry_after = ?delay,
                    "Reconcile failed, will retry with backoff"
                );
                self.metrics
                    .observe_reconciliation(&kind, "error", duration);
                self.metrics
                    .requeues_total
                    .with_label_values(&[kind.as_str(), "backoff"])
                    .inc();
                let reason = dirty_reason.map_or(request.reason, |d| request.reason.merge(d));
                self.enqueue_after(key, reason, delay);
            }
        }
    }

    fn reset_backoff(&self, key: &ObjectKey) {
        self.state
            .lock()
            .expect("queue state poisoned")
            .attempts
            .remove(key);
    }

    /// Exponential backoff for the nth consecutive failure, capped and
    /// jittered to prevent thundering herd.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = base * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay.as_secs_f64());

        if self.config.jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let delta = capped * self.config.jitter;
        let jittered = rand::rng().random_range((capped - delta)..=(capped + delta));
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Periodically refresh the heartbeat while the state lock is provably
    /// acquirable, so the liveness probe detects a deadlocked scheduler.
    async fn watchdog_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            {
                let _state = self.state.lock().expect("queue state poisoned");
            }
            *self.heartbeat.lock().expect("heartbeat poisoned") = Instant::now();
        }
    }
}

/// Default stall threshold used by the liveness probe.
#[must_use]
pub fn default_stall_threshold() -> Duration {
    Duration::from_secs(SCHEDULER_STALL_THRESHOLD_SECS)
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod queue_tests;
