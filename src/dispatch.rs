// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Reconcile dispatcher: resolves a queued key to its registered reconciler
//! and invokes it against the *current* object state.
//!
//! Dispatch reads from the kind's store at invocation time, never from the
//! event that scheduled the key. This makes the system level-triggered: a
//! missed or duplicated event cannot cause incorrect convergence because the
//! reconciler always re-derives from current state. If the object is gone by
//! dispatch time, the reconciler's deletion path runs exactly once and the
//! key is not re-enqueued.

use crate::context::Context;
use crate::queue::ReconcileRequest;
use crate::reconcilers::{Action, ReconcileError};
use crate::registry::KindRegistry;
use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Contract between the scheduler's workers and the dispatcher.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Resolve and run the reconciler for one request.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the reconciler fails; the scheduler
    /// retries with backoff.
    async fn dispatch(&self, request: &ReconcileRequest) -> Result<Action, ReconcileError>;
}

/// Default dispatcher backed by the kind registry and the shared stores.
pub struct Dispatcher {
    ctx: Arc<Context>,
    registry: Arc<KindRegistry>,
}

impl Dispatcher {
    /// Build a dispatcher for the given context and registry.
    #[must_use]
    pub fn new(ctx: Arc<Context>, registry: Arc<KindRegistry>) -> Self {
        Self { ctx, registry }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, request: &ReconcileRequest) -> Result<Action, ReconcileError> {
        let key = &request.key;

        let Some(entry) = self.registry.get(&key.kind) else {
            // Only registered kinds are watched; reaching this is a wiring
            // bug, not a retryable condition.
            error!(key = %key, "No reconciler registered for kind, dropping");
            return Ok(Action::Done);
        };
        let Some(store) = self.ctx.stores.get(&key.kind) else {
            error!(key = %key, "No store for kind, dropping");
            return Ok(Action::Done);
        };

        match store.get(key) {
            Some(obj) => {
                debug!(key = %key, "Reconciling current state");
                let fut = entry.reconciler.reconcile(Arc::clone(&self.ctx), obj);
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(ReconcileError::from(anyhow!(
                        "reconciler for {} panicked: {}",
                        key,
                        panic_message(&payload)
                    ))),
                }
            }
            None => {
                info!(key = %key, "Object gone, running deletion path");
                let fut = entry.reconciler.finalize(Arc::clone(&self.ctx), key);
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        // The deletion path runs exactly once; failures are
                        // surfaced for observability but never retried.
                        error!(key = %key, error = %err, "Deletion path failed");
                    }
                    Err(payload) => {
                        error!(
                            key = %key,
                            panic = %panic_message(&payload),
                            "Deletion path panicked"
                        );
                    }
                }
                Ok(Action::Done)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod dispatch_tests;
