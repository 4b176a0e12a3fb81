// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Liveness and readiness probes, plus the metrics endpoint.
//!
//! Liveness reports unhealthy only when the scheduler watchdog detects a
//! stall; the process is otherwise assumed live. Readiness requires every
//! object store to have completed its initial list and, when leader election
//! is enabled, a leadership decision to have been reached; a follower is
//! still ready, because admission does not require leadership.
//!
//! Checks are registered by name before the manager starts; registration is
//! rejected once a name is taken so probe output stays unambiguous.

use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A named probe predicate; `Err` carries the failure detail.
pub type Check = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Registered liveness and readiness checks.
#[derive(Default)]
pub struct HealthChecks {
    healthz: Vec<(String, Check)>,
    readyz: Vec<(String, Check)>,
}

impl HealthChecks {
    /// Empty check set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a liveness check.
    ///
    /// # Errors
    ///
    /// Returns the duplicate name when a check with this name exists.
    pub fn add_healthz(&mut self, name: &str, check: Check) -> Result<(), String> {
        if self.healthz.iter().any(|(n, _)| n == name) {
            return Err(format!("healthz check {name} already registered"));
        }
        self.healthz.push((name.to_string(), check));
        Ok(())
    }

    /// Register a readiness check.
    ///
    /// # Errors
    ///
    /// Returns the duplicate name when a check with this name exists.
    pub fn add_readyz(&mut self, name: &str, check: Check) -> Result<(), String> {
        if self.readyz.iter().any(|(n, _)| n == name) {
            return Err(format!("readyz check {name} already registered"));
        }
        self.readyz.push((name.to_string(), check));
        Ok(())
    }

    /// Run all liveness checks; failures are (name, detail) pairs.
    #[must_use]
    pub fn run_healthz(&self) -> Vec<(String, String)> {
        run_checks(&self.healthz)
    }

    /// Run all readiness checks; failures are (name, detail) pairs.
    #[must_use]
    pub fn run_readyz(&self) -> Vec<(String, String)> {
        run_checks(&self.readyz)
    }
}

fn run_checks(checks: &[(String, Check)]) -> Vec<(String, String)> {
    checks
        .iter()
        .filter_map(|(name, check)| check().err().map(|detail| (name.clone(), detail)))
        .collect()
}

/// A check that always passes, for basic process-up probes.
#[must_use]
pub fn ping() -> Check {
    Box::new(|| Ok(()))
}

#[derive(Clone)]
struct ProbeState {
    checks: Arc<HealthChecks>,
    metrics: Arc<Metrics>,
}

/// Build the probe router: `/healthz`, `/readyz` and `/metrics`.
#[must_use]
pub fn health_router(checks: Arc<HealthChecks>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(ProbeState { checks, metrics })
}

async fn healthz_handler(State(state): State<ProbeState>) -> (StatusCode, String) {
    probe_response(state.checks.run_healthz())
}

async fn readyz_handler(State(state): State<ProbeState>) -> (StatusCode, String) {
    probe_response(state.checks.run_readyz())
}

async fn metrics_handler(State(state): State<ProbeState>) -> String {
    state.metrics.encode()
}

fn probe_response(failures: Vec<(String, String)>) -> (StatusCode, String) {
    if failures.is_empty() {
        return (StatusCode::OK, "ok".to_string());
    }
    let mut body = String::new();
    for (name, detail) in &failures {
        let _ = writeln!(body, "check {name} failed: {detail}");
    }
    debug!(failures = failures.len(), "Probe failing");
    (StatusCode::SERVICE_UNAVAILABLE, body)
}

/// Serve the probe router until cancelled.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve_health(
    addr: std::net::SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health probe server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Health probe server stopped");
    Ok(())
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod health_tests;
