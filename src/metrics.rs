// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the atrk controller manager.
//!
//! All metrics live in an explicit [`Metrics`] handle owned by the shared
//! [`Context`](crate::context::Context) rather than a process-global
//! registry, so components stay independently testable with fresh instances.
//! The namespace prefix is `atrk_atro_xyz` (prometheus-safe version of
//! "atrk.atro.xyz").

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Namespace prefix for all atrk metrics (prometheus-safe)
const METRICS_NAMESPACE: &str = "atrk_atro_xyz";

/// Metrics handle shared across all manager components.
pub struct Metrics {
    registry: Registry,

    /// Total reconciliations by resource kind and outcome
    /// (`done`, `requeue_after`, `requeue`, `error`, `discarded`)
    pub reconciliations_total: CounterVec,

    /// Duration of reconcile invocations in seconds by resource kind
    pub reconcile_duration_seconds: HistogramVec,

    /// Total requeue operations by resource kind and reason
    /// (`backoff`, `requeue_after`, `requeue`, `dirty`)
    pub requeues_total: CounterVec,

    /// Number of keys currently waiting in the work queue
    pub queue_depth: IntGauge,

    /// 1 while this instance holds the leader lease, 0 otherwise
    pub leader: IntGauge,

    /// Total admission decisions by resource kind and outcome (`allow`, `deny`)
    pub admission_decisions_total: CounterVec,

    /// Total relists performed per kind after watch disconnects
    pub watch_relists_total: CounterVec,
}

impl Metrics {
    /// Build a fresh metrics handle with its own registry.
    ///
    /// # Errors
    ///
    /// Returns a [`prometheus::Error`] if a collector cannot be registered;
    /// treated as a manager construction failure.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_reconciliations_total"),
                "Total number of reconciliations by resource kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{METRICS_NAMESPACE}_reconcile_duration_seconds"),
                "Duration of reconcile invocations in seconds by resource kind",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["kind"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let requeues_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_requeues_total"),
                "Total number of requeue operations by resource kind and reason",
            ),
            &["kind", "reason"],
        )?;
        registry.register(Box::new(requeues_total.clone()))?;

        let queue_depth = IntGauge::new(
            format!("{METRICS_NAMESPACE}_queue_depth"),
            "Number of keys currently waiting in the work queue",
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let leader = IntGauge::new(
            format!("{METRICS_NAMESPACE}_leader"),
            "1 while this instance holds the leader lease, 0 otherwise",
        )?;
        registry.register(Box::new(leader.clone()))?;

        let admission_decisions_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_admission_decisions_total"),
                "Total number of admission decisions by resource kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(admission_decisions_total.clone()))?;

        let watch_relists_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_watch_relists_total"),
                "Total number of relists performed per kind after watch disconnects",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(watch_relists_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            requeues_total,
            queue_depth,
            leader,
            admission_decisions_total,
            watch_relists_total,
        })
    }

    /// Record one finished reconcile invocation.
    pub fn observe_reconciliation(&self, kind: &str, outcome: &str, duration: Duration) {
        self.reconciliations_total
            .with_label_values(&[kind, outcome])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }

    /// Encode all registered metrics in the Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %err, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod metrics_tests;
