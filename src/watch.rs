// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Watch multiplexer and per-kind object stores.
//!
//! One watcher task runs per registered kind. Each subscribes to the cluster
//! state source, reconciles its local [`Store`] against a full list snapshot,
//! then consumes incremental events, translating every observed
//! add/update/delete into a work-queue enqueue. On a disconnect the watcher
//! relists and resyncs the store before resuming, so an update that happened
//! during the outage is never permanently missed; reconcilers see the
//! outage only as an ordinary change notification, if at all.

use crate::cluster::WatchEvent;
use crate::context::Context;
use crate::crd::{DynamicObject, KindId, ObjectKey};
use crate::queue::{ChangeReason, Scheduler};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::WATCH_RELIST_BACKOFF_SECS;

/// In-memory cache of the current objects of one kind.
///
/// Populated exclusively by that kind's watcher task; read by the dispatcher
/// (level-triggered reads) and the readiness probe.
#[derive(Clone)]
pub struct Store {
    objects: Arc<RwLock<HashMap<ObjectKey, Arc<DynamicObject>>>>,
    synced_tx: Arc<watch::Sender<bool>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Empty, not-yet-synced store.
    #[must_use]
    pub fn new() -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            synced_tx: Arc::new(synced_tx),
        }
    }

    /// Current state of an object, if present.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.objects
            .read()
            .expect("store poisoned")
            .get(key)
            .cloned()
    }

    /// Insert or replace an object. Returns true when the key was new.
    pub fn insert(&self, obj: DynamicObject) -> bool {
        let key = obj.key();
        self.objects
            .write()
            .expect("store poisoned")
            .insert(key, Arc::new(obj))
            .is_none()
    }

    /// Remove an object, returning its last known state.
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.objects.write().expect("store poisoned").remove(key)
    }

    /// Keys of all cached objects.
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects
            .read()
            .expect("store poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().expect("store poisoned").len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the initial list as complete; flips the readiness contribution.
    pub fn mark_synced(&self) {
        self.synced_tx.send_replace(true);
    }

    /// Whether the initial list completed at least once.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }
}

/// Run the watcher for one kind until cancelled.
///
/// Subscribes before listing so events raced during the resync are buffered
/// rather than lost; duplicates are harmless because reconciliation is
/// level-triggered.
pub async fn run_watcher(
    ctx: Arc<Context>,
    scheduler: Arc<Scheduler>,
    kind: KindId,
    cancel: CancellationToken,
) {
    info!(kind = %kind, "Starting watcher");

    let Some(store) = ctx.stores.get(&kind).cloned() else {
        error!(kind = %kind, "No store for kind, watcher not started");
        return;
    };

    let relist_backoff = Duration::from_secs(WATCH_RELIST_BACKOFF_SECS);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let stream = match ctx.cluster.watch(&kind).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(kind = %kind, error = %err, "Failed to subscribe, will retry");
                if sleep_or_cancelled(relist_backoff, &cancel).await {
                    break;
                }
                continue;
            }
        };

        if let Err(err) = resync(&ctx, &store, &scheduler, &kind).await {
            warn!(kind = %kind, error = %err, "Relist failed, will retry");
            if sleep_or_cancelled(relist_backoff, &cancel).await {
                break;
            }
            continue;
        }
        store.mark_synced();

        let mut stream = stream;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(kind = %kind, "Watcher stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(WatchEvent::Applied(obj))) => {
                        let key = obj.key();
                        let was_new = store.insert(obj);
                        let reason = if was_new {
                            ChangeReason::Created
                        } else {
                            ChangeReason::Updated
                        };
                        debug!(kind = %kind, key = %key, reason = reason.as_str(), "Observed change");
                        scheduler.enqueue(key, reason);
                    }
                    Some(Ok(WatchEvent::Deleted(obj))) => {
                        let key = obj.key();
                        store.remove(&key);
                        debug!(kind = %kind, key = %key, "Observed deletion");
                        scheduler.enqueue(key, ChangeReason::Deleted);
                    }
                    Some(Err(err)) => {
                        warn!(kind = %kind, error = %err, "Watch disconnected, relisting");
                        break;
                    }
                    None => {
                        warn!(kind = %kind, "Watch stream ended, relisting");
                        break;
                    }
                }
            }
        }

        if sleep_or_cancelled(relist_backoff, &cancel).await {
            break;
        }
    }
    info!(kind = %kind, "Watcher stopped");
}

/// Reconcile the store against a fresh list snapshot: add missing objects,
/// update changed ones, drop extras. Every difference becomes an enqueue.
async fn resync(
    ctx: &Context,
    store: &Store,
    scheduler: &Scheduler,
    kind: &KindId,
) -> Result<(), crate::cluster::ClusterError> {
    let snapshot = ctx.cluster.list(kind).await?;
    ctx.metrics
        .watch_relists_total
        .with_label_values(&[kind.kind.as_str()])
        .inc();

    let mut seen = HashSet::with_capacity(snapshot.len());
    for obj in snapshot {
        let key = obj.key();
        seen.insert(key.clone());
        match store.get(&key) {
            None => {
                store.insert(obj);
                scheduler.enqueue(key, ChangeReason::Created);
            }
            Some(cached) if cached.metadata.resource_version != obj.metadata.resource_version => {
                store.insert(obj);
                scheduler.enqueue(key, ChangeReason::Updated);
            }
            Some(_) => {}
        }
    }

    for key in store.keys() {
        if !seen.contains(&key) {
            store.remove(&key);
            scheduler.enqueue(key, ChangeReason::Deleted);
        }
    }
    Ok(())
}

/// Sleep unless cancelled first; returns true when cancelled.
async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod watch_tests;
