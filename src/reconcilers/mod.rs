// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Reconciler contract and the built-in App/AppBase reconcilers.
//!
//! The manager core is level-triggered: a reconciler is always handed the
//! *current* state of its object, never the event that scheduled it, so a
//! missed or duplicated notification cannot cause incorrect convergence.
//! Reconcilers must be idempotent and safe to invoke repeatedly for the same
//! key.
//!
//! # Available Reconcilers
//!
//! - [`app::AppReconciler`] - drives `App` resources toward their declared state
//! - [`app_base::AppBaseReconciler`] - validates and tracks `AppBase` defaults

use crate::context::Context;
use crate::crd::{DynamicObject, ObjectKey};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod app;
pub mod app_base;

/// What the scheduler should do with a key after a successful reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Converged; do not requeue and reset the key's backoff
    Done,
    /// Re-dispatch no earlier than the given delay, without growing backoff
    RequeueAfter(Duration),
    /// Re-insert at the back of the queue immediately, without growing backoff
    Requeue,
}

/// Failure produced by a reconciler; always retried with capped backoff.
///
/// A reconciler that considers an error terminal records the condition for
/// observability and returns [`Action::Done`] instead; the core never
/// decides an error is terminal.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ReconcileError(#[from] anyhow::Error);

/// Per-kind reconciliation logic invoked by the dispatcher.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Drive the object toward its declared desired state.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] on transient failure; the scheduler retries
    /// with exponential backoff until a non-error result is returned.
    async fn reconcile(
        &self,
        ctx: Arc<Context>,
        obj: Arc<DynamicObject>,
    ) -> Result<Action, ReconcileError>;

    /// Clean up after the object was deleted. Invoked exactly once per
    /// deletion; the key is not re-enqueued afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] on failure; the error is logged but the
    /// deletion path is never retried.
    async fn finalize(&self, ctx: Arc<Context>, key: &ObjectKey) -> Result<(), ReconcileError>;
}
