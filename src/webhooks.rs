// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Default admission hooks for `App` and `AppBase`.
//!
//! Hooks are pure functions of the (old, new) object pair: the defaulters
//! fill unset fields and stamp the managed-by label, the validators enforce
//! structural rules and field immutability. Anything that needs cluster
//! state belongs in a reconciler, not here.

use crate::admission::{AdmissionError, MutatingHook, ValidatingHook};
use crate::crd::{App, AppBase, DynamicObject, EnvVar};
use std::collections::HashSet;

/// Label stamped on every admitted object.
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Maximum object name length accepted by the cluster.
const MAX_NAME_LEN: usize = 63;

fn hook_failure(hook: &'static str, err: impl std::fmt::Display) -> AdmissionError {
    AdmissionError::HookFailure {
        hook: hook.to_string(),
        message: err.to_string(),
    }
}

fn stamp_managed_by(obj: &mut DynamicObject) {
    obj.metadata
        .labels
        .entry(MANAGED_BY_LABEL.to_string())
        .or_insert_with(|| "atrk".to_string());
}

fn validate_name(name: &str) -> Result<(), AdmissionError> {
    if name.is_empty() {
        return Err(AdmissionError::Denied("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AdmissionError::Denied(format!(
            "name {name} exceeds {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_env(env: Option<&Vec<EnvVar>>) -> Result<(), AdmissionError> {
    let Some(env) = env else { return Ok(()) };
    let mut seen = HashSet::new();
    for var in env {
        if !seen.insert(var.name.as_str()) {
            return Err(AdmissionError::Denied(format!(
                "duplicate environment variable {}",
                var.name
            )));
        }
    }
    Ok(())
}

// ============================================================================
// App hooks
// ============================================================================

/// Fills `App` defaults: one replica, managed-by label.
pub struct AppDefaulter;

impl MutatingHook for AppDefaulter {
    fn name(&self) -> &'static str {
        "app-defaulter"
    }

    fn mutate(
        &self,
        _old: Option<&DynamicObject>,
        mut new: DynamicObject,
    ) -> Result<DynamicObject, AdmissionError> {
        let mut app = App::from_dynamic(&new).map_err(|err| hook_failure(self.name(), err))?;

        if app.spec.replicas.is_none() {
            app.spec.replicas = Some(1);
        }

        new.spec =
            serde_json::to_value(&app.spec).map_err(|err| hook_failure(self.name(), err))?;
        stamp_managed_by(&mut new);
        Ok(new)
    }
}

/// Enforces `App` structural rules and immutability of the base reference.
pub struct AppValidator;

impl ValidatingHook for AppValidator {
    fn name(&self) -> &'static str {
        "app-validator"
    }

    fn validate(
        &self,
        old: Option<&DynamicObject>,
        new: &DynamicObject,
    ) -> Result<(), AdmissionError> {
        let app = App::from_dynamic(new).map_err(|err| hook_failure(self.name(), err))?;

        validate_name(&app.metadata.name)?;
        validate_env(app.spec.env.as_ref())?;

        if app.spec.replicas.is_some_and(|r| r < 0) {
            return Err(AdmissionError::Denied(
                "replicas must not be negative".to_string(),
            ));
        }
        if app.spec.image.is_none() && app.spec.app_base.is_none() {
            return Err(AdmissionError::Denied(
                "either image or appBase must be set".to_string(),
            ));
        }
        if app.spec.image.as_deref() == Some("") {
            return Err(AdmissionError::Denied(
                "image must not be empty".to_string(),
            ));
        }

        // The base reference is fixed for the lifetime of an App; moving an
        // App between bases silently rewires its defaults.
        if let Some(old) = old {
            let old_app = App::from_dynamic(old).map_err(|err| hook_failure(self.name(), err))?;
            if old_app.spec.app_base != app.spec.app_base {
                return Err(AdmissionError::Denied(
                    "appBase reference is immutable".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// AppBase hooks
// ============================================================================

/// Fills `AppBase` defaults: one replica, managed-by label.
pub struct AppBaseDefaulter;

impl MutatingHook for AppBaseDefaulter {
    fn name(&self) -> &'static str {
        "appbase-defaulter"
    }

    fn mutate(
        &self,
        _old: Option<&DynamicObject>,
        mut new: DynamicObject,
    ) -> Result<DynamicObject, AdmissionError> {
        let mut base = AppBase::from_dynamic(&new).map_err(|err| hook_failure(self.name(), err))?;

        if base.spec.replicas.is_none() {
            base.spec.replicas = Some(1);
        }

        new.spec =
            serde_json::to_value(&base.spec).map_err(|err| hook_failure(self.name(), err))?;
        stamp_managed_by(&mut new);
        Ok(new)
    }
}

/// Enforces `AppBase` structural rules.
pub struct AppBaseValidator;

impl ValidatingHook for AppBaseValidator {
    fn name(&self) -> &'static str {
        "appbase-validator"
    }

    fn validate(
        &self,
        _old: Option<&DynamicObject>,
        new: &DynamicObject,
    ) -> Result<(), AdmissionError> {
        let base = AppBase::from_dynamic(new).map_err(|err| hook_failure(self.name(), err))?;

        validate_name(&base.metadata.name)?;
        validate_env(base.spec.env.as_ref())?;

        if base.spec.replicas.is_some_and(|r| r < 0) {
            return Err(AdmissionError::Denied(
                "replicas must not be negative".to_string(),
            ));
        }
        if base.spec.image.as_deref() == Some("") {
            return Err(AdmissionError::Denied(
                "image must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "webhooks_tests.rs"]
mod webhooks_tests;
