// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Custom resource types and the generic object envelope.
//!
//! The manager core is kind-agnostic: watchers, the work queue and the
//! admission pipeline all operate on [`DynamicObject`], a minimal envelope of
//! apiVersion/kind, metadata and untyped spec/status payloads. The typed
//! `App` and `AppBase` resources decode from that envelope on demand, inside
//! reconcilers and admission hooks.
//!
//! # Resource Kinds
//!
//! - [`AppBase`] - reusable defaults (image, replicas, environment) that
//!   `App` resources can reference by name
//! - [`App`] - a deployable application, optionally layered on an `AppBase`

use crate::constants::{API_GROUP, API_VERSION, KIND_APP, KIND_APP_BASE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Group/version/kind triple identifying a watched resource kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindId {
    /// API group, e.g. `atro.xyz`
    pub group: String,
    /// API version within the group, e.g. `v1alpha1`
    pub version: String,
    /// Kind name, e.g. `App`
    pub kind: String,
}

impl KindId {
    /// Build a kind identifier from its parts.
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The `group/version` string as it appears in an object's `apiVersion`.
    #[must_use]
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    /// Path segment used for this kind's admission endpoint,
    /// e.g. `atro-xyz-v1alpha1-app`.
    #[must_use]
    pub fn path_segment(&self) -> String {
        format!(
            "{}-{}-{}",
            self.group.replace('.', "-"),
            self.version,
            self.kind.to_lowercase()
        )
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// Uniquely identifies a reconcilable object; the work-queue deduplication key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace the object lives in
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Kind of the object
    pub kind: KindId,
}

impl ObjectKey {
    /// Build a key from namespace, name and kind.
    #[must_use]
    pub fn new(namespace: &str, name: &str, kind: KindId) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.kind, self.namespace, self.name)
    }
}

/// Standard object metadata carried by every resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace for a given kind
    pub name: String,

    /// Namespace; empty for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Opaque version token bumped by the cluster state source on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Spec generation, bumped on spec changes only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,

    /// Object labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Untyped object envelope flowing through watchers, the queue and admission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    /// `group/version` of the object
    pub api_version: String,

    /// Kind name of the object
    pub kind: String,

    /// Standard object metadata
    pub metadata: ObjectMeta,

    /// Kind-specific desired state, decoded lazily
    #[serde(default)]
    pub spec: Value,

    /// Kind-specific observed state, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl DynamicObject {
    /// The kind identifier of this object, parsed from `apiVersion` + `kind`.
    #[must_use]
    pub fn kind_id(&self) -> KindId {
        let (group, version) = self
            .api_version
            .split_once('/')
            .unwrap_or(("", self.api_version.as_str()));
        KindId::new(group, version, &self.kind)
    }

    /// The work-queue key of this object.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            &self.metadata.name,
            self.kind_id(),
        )
    }
}

/// Failure to decode a typed resource out of a [`DynamicObject`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The envelope carries a different kind than the decoder expects.
    #[error("expected kind {expected}, got {got}")]
    KindMismatch {
        /// Kind the decoder was built for
        expected: String,
        /// Kind found in the envelope
        got: String,
    },

    /// The spec or status payload does not match the typed schema.
    #[error("invalid {kind} payload: {source}")]
    Payload {
        /// Kind being decoded
        kind: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

/// A single status condition, mirroring the Kubernetes condition convention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`
    pub r#type: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition last changed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Returns true when `status.conditions` carries `Ready=True`.
///
/// Used by reconcilers to pick a requeue cadence: Ready resources are
/// revisited slowly, not-Ready ones quickly.
#[must_use]
pub fn is_ready(conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .any(|c| c.r#type == "Ready" && c.status == "True")
}

/// A single environment variable entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

// ============================================================================
// AppBase
// ============================================================================

/// Desired state of an `AppBase`: reusable defaults shared by `App`s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBaseSpec {
    /// Default container image for apps built on this base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Default replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Default environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
}

/// Observed state of an `AppBase`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBaseStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Spec generation the status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Reusable application defaults referenced by `App` resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBase {
    /// Standard object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: AppBaseSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AppBaseStatus>,
}

impl AppBase {
    /// Kind identifier for `AppBase`.
    #[must_use]
    pub fn kind_id() -> KindId {
        KindId::new(API_GROUP, API_VERSION, KIND_APP_BASE)
    }

    /// Decode an `AppBase` from the generic envelope.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the envelope carries a different kind or
    /// the payload does not match the `AppBase` schema.
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, DecodeError> {
        decode_checked(obj, KIND_APP_BASE)
    }

    /// Registry decode capability for `AppBase`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the object is not a well-formed `AppBase`.
    pub fn decode(obj: &DynamicObject) -> Result<(), DecodeError> {
        Self::from_dynamic(obj).map(|_| ())
    }
}

// ============================================================================
// App
// ============================================================================

/// Desired state of an `App`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Name of the `AppBase` supplying defaults, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_base: Option<String>,

    /// Container image; overrides the base image when both are set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Replica count; overrides the base value when both are set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Environment variables appended to the base environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
}

/// Observed state of an `App`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Spec generation the status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A deployable application, optionally layered on an [`AppBase`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Standard object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: AppSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AppStatus>,
}

impl App {
    /// Kind identifier for `App`.
    #[must_use]
    pub fn kind_id() -> KindId {
        KindId::new(API_GROUP, API_VERSION, KIND_APP)
    }

    /// Decode an `App` from the generic envelope.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the envelope carries a different kind or
    /// the payload does not match the `App` schema.
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, DecodeError> {
        decode_checked(obj, KIND_APP)
    }

    /// Registry decode capability for `App`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the object is not a well-formed `App`.
    pub fn decode(obj: &DynamicObject) -> Result<(), DecodeError> {
        Self::from_dynamic(obj).map(|_| ())
    }
}

/// Decode a typed resource after checking the envelope's kind.
fn decode_checked<T: for<'de> Deserialize<'de>>(
    obj: &DynamicObject,
    kind: &str,
) -> Result<T, DecodeError> {
    if obj.kind != kind {
        return Err(DecodeError::KindMismatch {
            expected: kind.to_string(),
            got: obj.kind.clone(),
        });
    }
    let value = serde_json::to_value(obj).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })?;
    serde_json::from_value(value).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
