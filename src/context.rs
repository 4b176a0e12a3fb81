// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Shared context passed to all manager components.
//!
//! The context carries the cluster handle, the per-kind object stores and
//! the metrics handle. It is built once at startup from the immutable kind
//! registry and passed by `Arc` into every component, so nothing reaches
//! for process-global state and each component remains independently
//! testable with fakes.

use crate::cluster::ClusterStateSource;
use crate::crd::KindId;
use crate::metrics::Metrics;
use crate::watch::Store;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared context for watchers, the dispatcher and reconcilers.
#[derive(Clone)]
pub struct Context {
    /// Handle to the external system of record
    pub cluster: Arc<dyn ClusterStateSource>,

    /// Object stores for all registered kinds
    pub stores: Stores,

    /// Metrics handle
    pub metrics: Arc<Metrics>,
}

/// Collection of per-kind object stores, fixed at startup.
#[derive(Clone)]
pub struct Stores {
    inner: Arc<HashMap<KindId, Store>>,
}

impl Stores {
    /// Build one empty store per registered kind.
    #[must_use]
    pub fn new<'a>(kinds: impl IntoIterator<Item = &'a KindId>) -> Self {
        let inner = kinds
            .into_iter()
            .map(|kind| (kind.clone(), Store::new()))
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Store for a kind, if it was registered.
    #[must_use]
    pub fn get(&self, kind: &KindId) -> Option<&Store> {
        self.inner.get(kind)
    }

    /// Whether every store completed its initial list; feeds readiness.
    #[must_use]
    pub fn all_synced(&self) -> bool {
        self.inner.values().all(Store::is_synced)
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
