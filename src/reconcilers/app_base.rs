// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Reconciliation logic for `AppBase` resources.

use crate::constants::{REQUEUE_PENDING_SECS, REQUEUE_READY_SECS};
use crate::context::Context;
use crate::crd::{is_ready, App, AppBase, DynamicObject, ObjectKey};
use crate::reconcilers::{Action, Reconciler, ReconcileError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Tracks `AppBase` resources and the `App`s layered on them.
pub struct AppBaseReconciler;

impl AppBaseReconciler {
    /// Names of the `App`s in the base's namespace that reference it.
    fn dependent_apps(ctx: &Context, base: &AppBase) -> Vec<String> {
        let namespace = base.metadata.namespace.as_deref().unwrap_or_default();
        let Some(store) = ctx.stores.get(&App::kind_id()) else {
            return Vec::new();
        };
        store
            .keys()
            .into_iter()
            .filter(|key| key.namespace == namespace)
            .filter_map(|key| store.get(&key))
            .filter_map(|obj| App::from_dynamic(&obj).ok())
            .filter(|app| app.spec.app_base.as_deref() == Some(base.metadata.name.as_str()))
            .map(|app| app.metadata.name)
            .collect()
    }
}

#[async_trait]
impl Reconciler for AppBaseReconciler {
    async fn reconcile(
        &self,
        ctx: Arc<Context>,
        obj: Arc<DynamicObject>,
    ) -> Result<Action, ReconcileError> {
        let base = AppBase::from_dynamic(&obj).map_err(anyhow::Error::new)?;

        let dependents = Self::dependent_apps(&ctx, &base);
        debug!(
            app_base = %base.metadata.name,
            namespace = ?base.metadata.namespace,
            dependents = dependents.len(),
            "Reconciled AppBase"
        );

        // Check if the base is ready to determine the requeue interval
        let ready = base
            .status
            .as_ref()
            .is_some_and(|status| is_ready(&status.conditions));

        if ready {
            Ok(Action::RequeueAfter(Duration::from_secs(REQUEUE_READY_SECS)))
        } else {
            Ok(Action::RequeueAfter(Duration::from_secs(
                REQUEUE_PENDING_SECS,
            )))
        }
    }

    async fn finalize(&self, _ctx: Arc<Context>, key: &ObjectKey) -> Result<(), ReconcileError> {
        info!(key = %key, "AppBase deleted, cleaning up");
        Ok(())
    }
}

#[cfg(test)]
#[path = "app_base_tests.rs"]
mod app_base_tests;
