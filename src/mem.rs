// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! In-memory backends for the cluster state source and the lease store.
//!
//! These power the standalone/dev mode of the binary and the test-suite.
//! [`MemoryCluster`] keeps per-kind object maps, bumps resource versions on
//! every write and fans watch events out to subscribers; dropping the
//! subscriber channels simulates a watch disconnect, which the multiplexer
//! must recover from via relist. [`MemoryLeaseStore`] implements the
//! compare-and-swap contract and can be told to fail writes, to exercise
//! proactive demotion.

use crate::cluster::{ClusterError, ClusterStateSource, WatchEvent};
use crate::crd::{DynamicObject, KindId, ObjectKey};
use crate::leader::{LeaseRecord, LeaseStore, LeaseStoreError, VersionedLease};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
struct KindState {
    objects: HashMap<ObjectKey, DynamicObject>,
    subscribers: Vec<mpsc::UnboundedSender<Result<WatchEvent, ClusterError>>>,
}

/// In-memory system of record with watch fan-out.
#[derive(Default)]
pub struct MemoryCluster {
    kinds: Mutex<HashMap<KindId, KindState>>,
    version: AtomicU64,
}

impl MemoryCluster {
    /// Empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update an object, stamping a fresh resource version and
    /// notifying watchers.
    pub fn apply(&self, mut obj: DynamicObject) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(version.to_string());

        let kind = obj.kind_id();
        let key = obj.key();
        let mut kinds = self.kinds.lock().expect("cluster state poisoned");
        let state = kinds.entry(kind).or_default();
        state.objects.insert(key, obj.clone());
        state
            .subscribers
            .retain(|tx| tx.send(Ok(WatchEvent::Applied(obj.clone()))).is_ok());
    }

    /// Delete an object, notifying watchers with its last known state.
    pub fn delete(&self, kind: &KindId, key: &ObjectKey) {
        let mut kinds = self.kinds.lock().expect("cluster state poisoned");
        if let Some(state) = kinds.get_mut(kind) {
            if let Some(obj) = state.objects.remove(key) {
                state
                    .subscribers
                    .retain(|tx| tx.send(Ok(WatchEvent::Deleted(obj.clone()))).is_ok());
            }
        }
    }

    /// Drop every active watch for a kind, simulating a disconnect.
    ///
    /// Subscribed streams end; the multiplexer is expected to relist.
    pub fn drop_watches(&self, kind: &KindId) {
        let mut kinds = self.kinds.lock().expect("cluster state poisoned");
        if let Some(state) = kinds.get_mut(kind) {
            state.subscribers.clear();
        }
    }
}

#[async_trait]
impl ClusterStateSource for MemoryCluster {
    async fn list(&self, kind: &KindId) -> Result<Vec<DynamicObject>, ClusterError> {
        let kinds = self.kinds.lock().expect("cluster state poisoned");
        Ok(kinds
            .get(kind)
            .map(|state| state.objects.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(
        &self,
        kind: &KindId,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        let kinds = self.kinds.lock().expect("cluster state poisoned");
        Ok(kinds
            .get(kind)
            .and_then(|state| state.objects.get(key).cloned()))
    }

    async fn watch(
        &self,
        kind: &KindId,
    ) -> Result<BoxStream<'static, Result<WatchEvent, ClusterError>>, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut kinds = self.kinds.lock().expect("cluster state poisoned");
            kinds.entry(kind.clone()).or_default().subscribers.push(tx);
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}

/// In-memory lease store with compare-and-swap writes.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, VersionedLease>>,
    next_version: AtomicU64,
    fail_puts: AtomicBool,
}

impl MemoryLeaseStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `put` calls fail as unavailable (test hook for
    /// exercising proactive demotion). Reads keep working.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Current holder of a lease, if any.
    #[must_use]
    pub fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().expect("lease state poisoned");
        leases.get(name).and_then(|l| l.record.holder.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseStoreError> {
        let leases = self.leases.lock().expect("lease state poisoned");
        Ok(leases.get(name).cloned())
    }

    async fn put(
        &self,
        name: &str,
        record: LeaseRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, LeaseStoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(LeaseStoreError::Unavailable("injected failure".to_string()));
        }

        let mut leases = self.leases.lock().expect("lease state poisoned");
        let current_version = leases.get(name).map(|l| l.version);
        if current_version != expected_version {
            return Err(LeaseStoreError::Conflict);
        }

        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        leases.insert(name.to_string(), VersionedLease { version, record });
        Ok(version)
    }
}

#[cfg(test)]
#[path = "mem_tests.rs"]
mod mem_tests;
