// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Unit tests for `queue.rs` - dedup, backoff and leadership gating

#[cfg(test)]
mod tests {
    use super::super::{ChangeReason, Scheduler, SchedulerConfig};
    use crate::crd::{KindId, ObjectKey};
    use crate::dispatch::Dispatch;
    use crate::leader::LeaderState;
    use crate::metrics::Metrics;
    use crate::queue::ReconcileRequest;
    use crate::reconcilers::{Action, ReconcileError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Dispatcher that records calls and replays a scripted result sequence;
    /// once the script is exhausted it returns `Done`.
    struct RecordingDispatcher {
        script: Mutex<VecDeque<Result<Action, ReconcileError>>>,
        calls: Mutex<Vec<(ObjectKey, Instant, u32)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl RecordingDispatcher {
        fn new(script: Vec<Result<Action, ReconcileError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> Vec<(ObjectKey, Instant, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatch for RecordingDispatcher {
        async fn dispatch(&self, request: &ReconcileRequest) -> Result<Action, ReconcileError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            self.calls.lock().unwrap().push((
                request.key.clone(),
                Instant::now(),
                request.attempts,
            ));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Action::Done))
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            drain_timeout: Duration::from_secs(1),
        }
    }

    fn new_scheduler(config: SchedulerConfig, cancel: &CancellationToken) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            config,
            Arc::new(Metrics::new().unwrap()),
            cancel.clone(),
        ))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(
            "default",
            name,
            KindId::new("atro.xyz", "v1alpha1", "App"),
        )
    }

    fn failed(msg: &str) -> Result<Action, ReconcileError> {
        Err(ReconcileError::from(anyhow::anyhow!(msg.to_string())))
    }

    fn leading() -> (watch::Sender<LeaderState>, watch::Receiver<LeaderState>) {
        watch::channel(LeaderState::Leading)
    }

    /// A burst of enqueues for one key collapses into a single pending entry
    /// and a single reconcile invocation.
    #[tokio::test(start_paused = true)]
    async fn test_burst_enqueue_single_invocation() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(Vec::new(), Duration::from_millis(50));
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            4,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        for _ in 0..50 {
            scheduler.enqueue(key("a"), ChangeReason::Updated);
        }
        assert_eq!(scheduler.queue_depth(), 1, "burst should merge to one entry");

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(dispatcher.calls().len(), 1);
        assert_eq!(dispatcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    /// Enqueues arriving while a key is being processed mark it dirty and
    /// trigger exactly one follow-up run, never a concurrent one.
    #[tokio::test(start_paused = true)]
    async fn test_dirty_key_reprocessed_after_current_attempt() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(Vec::new(), Duration::from_millis(100));
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            4,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        // Let a worker pick the key up, then pile on more enqueues.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..10 {
            scheduler.enqueue(key("a"), ChangeReason::Updated);
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(dispatcher.calls().len(), 2, "one run plus one dirty rerun");
        assert_eq!(dispatcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    /// Failures retry with strictly non-decreasing backoff, and the first
    /// non-error result resets the key's backoff to the base delay.
    #[tokio::test(start_paused = true)]
    async fn test_backoff_non_decreasing_until_success_then_reset() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(
            vec![failed("boom"), failed("boom"), failed("boom"), Ok(Action::Done)],
            Duration::ZERO,
        );
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            1,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 4, "three failures then success");

        // Attempt counts surface prior failures.
        let attempts: Vec<u32> = calls.iter().map(|(_, _, a)| *a).collect();
        assert_eq!(attempts, vec![0, 1, 2, 3]);

        // Gaps between retries never shrink (10ms, 20ms, 40ms with no jitter).
        let gaps: Vec<Duration> = calls
            .windows(2)
            .map(|pair| pair[1].1.duration_since(pair[0].1))
            .collect();
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps[1] >= gaps[0], "backoff must not decrease: {gaps:?}");
        assert!(gaps[2] >= gaps[1], "backoff must not decrease: {gaps:?}");

        // After Done the backoff is back at the base.
        scheduler.enqueue(key("a"), ChangeReason::Updated);
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[4].2, 0, "backoff resets after a non-error result");
    }

    /// Retry delays cap at the configured maximum.
    #[tokio::test(start_paused = true)]
    async fn test_backoff_capped_at_max_delay() {
        let cancel = CancellationToken::new();
        let config = SchedulerConfig {
            max_delay: Duration::from_millis(20),
            ..test_config()
        };
        let scheduler = new_scheduler(config, &cancel);
        let dispatcher = RecordingDispatcher::new(
            vec![failed("a"), failed("b"), failed("c"), failed("d")],
            Duration::ZERO,
        );
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            1,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 5);
        let last_gap = calls[4].1.duration_since(calls[3].1);
        assert!(
            last_gap <= Duration::from_millis(30),
            "delay should cap at 20ms, got {last_gap:?}"
        );
    }

    /// `RequeueAfter` re-dispatches no earlier than the requested delay and
    /// does not grow backoff.
    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_honors_delay() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(
            vec![Ok(Action::RequeueAfter(Duration::from_millis(300)))],
            Duration::ZERO,
        );
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            2,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 2);
        let gap = calls[1].1.duration_since(calls[0].1);
        assert!(
            gap >= Duration::from_millis(300),
            "re-dispatched too early: {gap:?}"
        );
        assert_eq!(calls[1].2, 0, "requeue-after must not grow backoff");
    }

    /// `Requeue` goes straight to the back of the queue.
    #[tokio::test(start_paused = true)]
    async fn test_requeue_immediately() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(vec![Ok(Action::Requeue)], Duration::ZERO);
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            1,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 2);
        let gap = calls[1].1.duration_since(calls[0].1);
        assert!(gap < Duration::from_millis(10), "no backoff expected: {gap:?}");
    }

    /// Workers dequeue nothing until leadership is held.
    #[tokio::test(start_paused = true)]
    async fn test_workers_gated_on_leadership() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(Vec::new(), Duration::ZERO);
        let (tx, rx) = watch::channel(LeaderState::Following);

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            2,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dispatcher.calls().is_empty(), "follower must not dispatch");

        tx.send(LeaderState::Leading).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(dispatcher.calls().len(), 1);
    }

    /// A result observed after leadership was lost is discarded: no retry,
    /// no requeue.
    #[tokio::test(start_paused = true)]
    async fn test_result_discarded_when_leadership_lost_mid_flight() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(vec![failed("boom")], Duration::from_millis(100));
        let (tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            1,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        scheduler.enqueue(key("a"), ChangeReason::Created);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.in_flight.load(Ordering::SeqCst), 1);

        // Demote while the reconcile is still running.
        tx.send(LeaderState::Following).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            dispatcher.calls().len(),
            1,
            "failed result must be discarded after demotion, not retried"
        );
    }

    /// Enqueue merges reasons: real changes win over resync, newer real
    /// changes win over older ones.
    #[tokio::test]
    async fn test_enqueue_merges_reasons() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);

        scheduler.enqueue(key("a"), ChangeReason::Created);
        scheduler.enqueue(key("a"), ChangeReason::Resync);
        {
            let state = scheduler.state.lock().unwrap();
            assert_eq!(state.pending.get(&key("a")), Some(&ChangeReason::Created));
            assert_eq!(state.fifo.len(), 1);
        }

        scheduler.enqueue(key("a"), ChangeReason::Deleted);
        {
            let state = scheduler.state.lock().unwrap();
            assert_eq!(state.pending.get(&key("a")), Some(&ChangeReason::Deleted));
            assert_eq!(state.fifo.len(), 1);
        }
    }

    #[test]
    fn test_change_reason_merge_rules() {
        assert_eq!(
            ChangeReason::Created.merge(ChangeReason::Resync),
            ChangeReason::Created
        );
        assert_eq!(
            ChangeReason::Created.merge(ChangeReason::Updated),
            ChangeReason::Updated
        );
        assert_eq!(
            ChangeReason::Updated.merge(ChangeReason::Deleted),
            ChangeReason::Deleted
        );
        assert_eq!(
            ChangeReason::Resync.merge(ChangeReason::Resync),
            ChangeReason::Resync
        );
    }

    /// Stall detection compares the heartbeat age against a threshold.
    #[tokio::test]
    async fn test_stall_detection_thresholds() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);

        assert!(!scheduler.is_stalled(Duration::from_secs(3600)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(scheduler.is_stalled(Duration::from_millis(5)));
    }

    /// Different keys are processed in parallel up to the pool size; the
    /// per-key invariant only serializes the same key.
    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_in_parallel() {
        let cancel = CancellationToken::new();
        let scheduler = new_scheduler(test_config(), &cancel);
        let dispatcher = RecordingDispatcher::new(Vec::new(), Duration::from_millis(100));
        let (_tx, rx) = leading();

        let handle = tokio::spawn(Scheduler::run(
            Arc::clone(&scheduler),
            4,
            dispatcher.clone(),
            rx,
            cancel.clone(),
        ));

        for name in ["a", "b", "c", "d"] {
            scheduler.enqueue(key(name), ChangeReason::Created);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(dispatcher.calls().len(), 4);
        assert!(
            dispatcher.max_in_flight.load(Ordering::SeqCst) > 1,
            "distinct keys should overlap"
        );
    }
}
