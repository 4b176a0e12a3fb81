// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Admission pipeline gating writes before they are persisted.
//!
//! For each request the pipeline runs the kind's mutating hooks in
//! registration order, each consuming the previous hook's output, then the
//! validating hooks against the fully mutated object, short-circuiting on
//! the first deny. A hook that fails internally is treated as a deny with
//! that error surfaced: admission never silently allows on hook malfunction.
//!
//! The pipeline holds no mutable state and is safe under arbitrary
//! concurrent invocation; admission is served by every replica regardless of
//! leadership.

use crate::crd::{DynamicObject, KindId};
use crate::metrics::Metrics;
use crate::registry::KindRegistry;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Failure inside an admission hook.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The object was rejected by a validating hook.
    #[error("{0}")]
    Denied(String),

    /// The hook itself malfunctioned; converted to a deny (fail-closed).
    #[error("admission hook {hook} failed: {message}")]
    HookFailure {
        /// Name of the failing hook
        hook: String,
        /// What went wrong
        message: String,
    },
}

/// A mutating admission hook: a pure function from (old-or-absent, new) to a
/// possibly-modified object.
pub trait MutatingHook: Send + Sync + 'static {
    /// Hook name, for logs and deny reasons.
    fn name(&self) -> &'static str;

    /// Produce the (possibly modified) object consumed by the next hook.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] on malfunction; the request is denied.
    fn mutate(
        &self,
        old: Option<&DynamicObject>,
        new: DynamicObject,
    ) -> Result<DynamicObject, AdmissionError>;
}

/// A validating admission hook: a pure predicate over (old-or-absent, new).
pub trait ValidatingHook: Send + Sync + 'static {
    /// Hook name, for logs and deny reasons.
    fn name(&self) -> &'static str;

    /// Accept or reject the fully mutated object.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Denied`] to reject, or
    /// [`AdmissionError::HookFailure`] on malfunction (also a deny).
    fn validate(
        &self,
        old: Option<&DynamicObject>,
        new: &DynamicObject,
    ) -> Result<(), AdmissionError>;
}

/// Outcome of one admission request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    /// Whether the write may proceed
    pub allowed: bool,

    /// The fully mutated object, present on allow when mutators ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<DynamicObject>,

    /// Human-readable reason, present on deny
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    fn allow(object: DynamicObject) -> Self {
        Self {
            allowed: true,
            object: Some(object),
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            object: None,
            reason: Some(reason),
        }
    }
}

/// Serialized old/new pair accepted by each kind's admission endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Prior state on update, absent on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<DynamicObject>,

    /// Incoming state to admit
    pub new_object: DynamicObject,
}

/// Runs the registered hooks for create/update requests.
pub struct AdmissionPipeline {
    registry: Arc<KindRegistry>,
    metrics: Arc<Metrics>,
}

impl AdmissionPipeline {
    /// Build a pipeline over the frozen registry.
    #[must_use]
    pub fn new(registry: Arc<KindRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Admit or reject a write for a registered kind.
    #[must_use]
    pub fn admit(
        &self,
        kind: &KindId,
        old: Option<&DynamicObject>,
        new: DynamicObject,
    ) -> AdmissionDecision {
        let decision = self.run_hooks(kind, old, new);
        let outcome = if decision.allowed { "allow" } else { "deny" };
        self.metrics
            .admission_decisions_total
            .with_label_values(&[kind.kind.as_str(), outcome])
            .inc();
        decision
    }

    fn run_hooks(
        &self,
        kind: &KindId,
        old: Option<&DynamicObject>,
        new: DynamicObject,
    ) -> AdmissionDecision {
        let Some(entry) = self.registry.get(kind) else {
            return AdmissionDecision::deny(format!("kind {kind} is not registered"));
        };

        if let Err(err) = (entry.decode)(&new) {
            debug!(kind = %kind, error = %err, "Rejecting malformed object");
            return AdmissionDecision::deny(err.to_string());
        }

        let mut current = new;
        for mutator in &entry.mutators {
            match mutator.mutate(old, current) {
                Ok(mutated) => current = mutated,
                Err(err) => {
                    error!(
                        kind = %kind,
                        hook = mutator.name(),
                        error = %err,
                        "Mutating hook failed, denying"
                    );
                    return AdmissionDecision::deny(err.to_string());
                }
            }
        }

        for validator in &entry.validators {
            match validator.validate(old, &current) {
                Ok(()) => {}
                Err(AdmissionError::Denied(reason)) => {
                    debug!(
                        kind = %kind,
                        hook = validator.name(),
                        reason = %reason,
                        "Object denied"
                    );
                    return AdmissionDecision::deny(reason);
                }
                Err(err) => {
                    error!(
                        kind = %kind,
                        hook = validator.name(),
                        error = %err,
                        "Validating hook failed, denying"
                    );
                    return AdmissionDecision::deny(err.to_string());
                }
            }
        }

        AdmissionDecision::allow(current)
    }
}

#[derive(Clone)]
struct EndpointState {
    pipeline: Arc<AdmissionPipeline>,
    kind: KindId,
}

/// Build the webhook router: one `POST /admit-<group>-<version>-<kind>`
/// endpoint per kind with registered hooks.
#[must_use]
pub fn webhook_router(pipeline: Arc<AdmissionPipeline>, registry: &KindRegistry) -> Router {
    let mut router = Router::new();
    for kind in registry.webhook_kinds() {
        let path = format!("/admit-{}", kind.path_segment());
        debug!(kind = %kind, path = %path, "Registering admission endpoint");
        router = router.route(
            &path,
            post(admit_handler).with_state(EndpointState {
                pipeline: Arc::clone(&pipeline),
                kind: kind.clone(),
            }),
        );
    }
    router
}

async fn admit_handler(
    State(state): State<EndpointState>,
    Json(request): Json<AdmissionRequest>,
) -> Json<AdmissionDecision> {
    let decision = state.pipeline.admit(
        &state.kind,
        request.old_object.as_ref(),
        request.new_object,
    );
    Json(decision)
}

/// Serve the webhook router until cancelled.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve_webhooks(
    addr: std::net::SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Webhook server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Webhook server stopped");
    Ok(())
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod admission_tests;
