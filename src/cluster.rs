// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Interface to the external system of record.
//!
//! The manager never talks to a cluster API server directly; everything goes
//! through [`ClusterStateSource`], which provides list/get snapshots and an
//! infinite, fallible watch stream per kind. A stream that errors or simply
//! ends is treated as a disconnect: the watch multiplexer relists the kind
//! and resumes, so reconcilers never observe the outage.

use crate::crd::{DynamicObject, KindId, ObjectKey};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A single change observed on the watch stream of a kind.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// Object was created or updated; carries the new state
    Applied(DynamicObject),
    /// Object was deleted; carries the last known state
    Deleted(DynamicObject),
}

/// Failure talking to the cluster state source.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The watch stream dropped; recovered internally via relist.
    #[error("watch disconnected: {0}")]
    Disconnected(String),

    /// The source rejected or could not serve the request.
    #[error("cluster state source error: {0}")]
    Source(String),
}

/// The external system of record for watched objects.
///
/// Implementations must be safe to share across tasks; the manager holds one
/// instance behind an `Arc` and calls it from every watcher concurrently.
#[async_trait]
pub trait ClusterStateSource: Send + Sync + 'static {
    /// Snapshot of all current objects of a kind.
    async fn list(&self, kind: &KindId) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Fetch a single object, or `None` if it does not exist.
    async fn get(&self, kind: &KindId, key: &ObjectKey)
        -> Result<Option<DynamicObject>, ClusterError>;

    /// Subscribe to changes for a kind.
    ///
    /// The returned stream yields every subsequent add/update/delete. It may
    /// error or end at any time; the caller is expected to relist and
    /// resubscribe.
    async fn watch(
        &self,
        kind: &KindId,
    ) -> Result<BoxStream<'static, Result<WatchEvent, ClusterError>>, ClusterError>;
}
