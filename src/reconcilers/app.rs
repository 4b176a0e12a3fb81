// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Reconciliation logic for `App` resources.

use crate::constants::{REQUEUE_PENDING_SECS, REQUEUE_READY_SECS};
use crate::context::Context;
use crate::crd::{is_ready, App, AppBase, DynamicObject, ObjectKey};
use crate::reconcilers::{Action, Reconciler, ReconcileError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drives `App` resources toward their declared state.
///
/// Resolution is layered: when `spec.appBase` names an [`AppBase`], its
/// defaults fill any field the `App` leaves unset. An `App` whose base has
/// not appeared yet is revisited on the fast cadence until it has.
pub struct AppReconciler;

#[async_trait]
impl Reconciler for AppReconciler {
    async fn reconcile(
        &self,
        ctx: Arc<Context>,
        obj: Arc<DynamicObject>,
    ) -> Result<Action, ReconcileError> {
        let app = App::from_dynamic(&obj).map_err(anyhow::Error::new)?;
        let namespace = app.metadata.namespace.as_deref().unwrap_or_default();

        // Resolve the referenced base from the shared store; reconciliation
        // reads current state, so a base created after this App converges on
        // the next pass.
        let base = match &app.spec.app_base {
            Some(base_name) => {
                let base_key = ObjectKey::new(namespace, base_name, AppBase::kind_id());
                let cached = ctx
                    .stores
                    .get(&AppBase::kind_id())
                    .and_then(|store| store.get(&base_key));
                match cached {
                    Some(base_obj) => Some(AppBase::from_dynamic(&base_obj).map_err(anyhow::Error::new)?),
                    None => {
                        info!(
                            app = %app.metadata.name,
                            namespace = namespace,
                            app_base = %base_name,
                            "Referenced AppBase not found yet, waiting"
                        );
                        return Ok(Action::RequeueAfter(Duration::from_secs(
                            REQUEUE_PENDING_SECS,
                        )));
                    }
                }
            }
            None => None,
        };

        let image = app
            .spec
            .image
            .clone()
            .or_else(|| base.as_ref().and_then(|b| b.spec.image.clone()));
        let Some(image) = image else {
            warn!(
                app = %app.metadata.name,
                namespace = namespace,
                "App resolves to no image, cannot converge"
            );
            return Ok(Action::RequeueAfter(Duration::from_secs(
                REQUEUE_PENDING_SECS,
            )));
        };

        let replicas = app
            .spec
            .replicas
            .or_else(|| base.as_ref().and_then(|b| b.spec.replicas))
            .unwrap_or(1);

        debug!(
            app = %app.metadata.name,
            namespace = namespace,
            image = %image,
            replicas = replicas,
            "Resolved desired state"
        );

        // Check if the app is ready to determine the requeue interval
        let ready = app
            .status
            .as_ref()
            .is_some_and(|status| is_ready(&status.conditions));

        if ready {
            // App is ready, check less frequently (5 minutes)
            Ok(Action::RequeueAfter(Duration::from_secs(REQUEUE_READY_SECS)))
        } else {
            // App is not ready, check more frequently (30 seconds)
            Ok(Action::RequeueAfter(Duration::from_secs(
                REQUEUE_PENDING_SECS,
            )))
        }
    }

    async fn finalize(&self, _ctx: Arc<Context>, key: &ObjectKey) -> Result<(), ReconcileError> {
        info!(key = %key, "App deleted, cleaning up");
        Ok(())
    }
}

#[cfg(test)]
#[path = "app_tests.rs"]
mod app_tests;
