// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Leader election over a compare-and-swap lease store.
//!
//! Replicated manager instances contend for a single named lease record.
//! Only the current holder runs reconcile workers; admission and watches run
//! on every replica. The protocol favors safety over liveness: a holder that
//! cannot renew demotes itself *before* the record could have expired for
//! other replicas, so two instances never act as leader at the same time.
//!
//! Timing defaults are 15s lease duration, 10s renew deadline and 2s retry
//! period; all three are injectable for tests.

use crate::constants::{LEASE_DURATION_SECS, RENEW_DEADLINE_SECS, RETRY_PERIOD_SECS};
use crate::metrics::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The persisted lease record contended for by manager replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Identity of the current holder; `None` after a deterministic release
    pub holder: Option<String>,
    /// When the current holder first acquired the lease
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last renewed
    pub renewed_at: DateTime<Utc>,
    /// Seconds the lease stays valid after `renewed_at`
    pub lease_duration_secs: u64,
    /// Number of leadership transitions, monotonically increasing
    pub term: u64,
}

impl LeaseRecord {
    /// Whether the record no longer protects its holder at `now`.
    ///
    /// A released record (no holder) is immediately available.
    #[must_use]
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.holder.is_none() {
            return true;
        }
        let deadline = self.renewed_at + chrono::Duration::seconds(self.lease_duration_secs as i64);
        deadline <= now
    }
}

/// A lease record together with its optimistic-concurrency version token.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedLease {
    /// Version token to pass back on the next compare-and-swap write
    pub version: u64,
    /// The record itself
    pub record: LeaseRecord,
}

/// Failure talking to the lease store.
#[derive(Debug, thiserror::Error)]
pub enum LeaseStoreError {
    /// The compare-and-swap version check failed: another replica wrote the
    /// record first. Expected in steady state, never fatal.
    #[error("lease version conflict")]
    Conflict,

    /// The store could not serve the request.
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}

/// Distributed lease store with compare-and-swap semantics on a named record.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Read the current record, or `None` if it was never written.
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseStoreError>;

    /// Write the record iff the stored version matches `expected_version`
    /// (`None` means "create, must not exist yet"). Returns the new version.
    async fn put(
        &self,
        name: &str,
        record: LeaseRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, LeaseStoreError>;
}

/// Local view of the leadership decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// No acquire attempt has completed yet; readiness waits on this
    Pending,
    /// This instance holds the lease; reconcile workers may run
    Leading,
    /// Another instance holds the lease; admission still serves
    Following,
}

/// Tunable timings and identity for one elector.
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// Name of the contended lease record
    pub lease_name: String,
    /// Identity written into the record while this instance holds it
    pub identity: String,
    /// How long the lease stays valid after a renewal
    pub lease_duration: Duration,
    /// How long the holder keeps leading without a successful renewal
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
}

impl ElectionConfig {
    /// Config with the default timings for a given lease name.
    #[must_use]
    pub fn new(lease_name: &str) -> Self {
        Self {
            lease_name: lease_name.to_string(),
            identity: default_identity(),
            lease_duration: Duration::from_secs(LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(RETRY_PERIOD_SECS),
        }
    }
}

/// Default holder identity: hostname plus a random suffix, so two replicas
/// on one host never collide.
#[must_use]
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "atrk".to_string());
    format!("{host}-{:08x}", rand::rng().random::<u32>())
}

/// Maintains the cluster-visible lease and surfaces the leadership signal.
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: ElectionConfig,
    state_tx: watch::Sender<LeaderState>,
    metrics: Arc<Metrics>,
}

impl LeaderElector {
    /// Build an elector and the receiver side of its leadership signal.
    #[must_use]
    pub fn new(
        store: Arc<dyn LeaseStore>,
        config: ElectionConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<LeaderState>) {
        let (state_tx, state_rx) = watch::channel(LeaderState::Pending);
        (
            Self {
                store,
                config,
                state_tx,
                metrics,
            },
            state_rx,
        )
    }

    /// Renewal loop: attempt acquire/renew every retry period until
    /// cancelled, then release the lease if still held.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "Starting leader election"
        );

        let mut last_renew: Option<Instant> = None;

        loop {
            let was_leading = *self.state_tx.borrow() == LeaderState::Leading;

            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renew = Some(Instant::now());
                    self.transition(LeaderState::Leading);
                }
                Ok(false) => {
                    last_renew = None;
                    self.transition(LeaderState::Following);
                }
                Err(err) => {
                    warn!(
                        lease = %self.config.lease_name,
                        error = %err,
                        "Lease store unreachable during acquire/renew"
                    );
                    // Proactive demotion: step down before the record could
                    // have expired for another replica.
                    if was_leading {
                        let deadline_passed = last_renew
                            .is_none_or(|t| t.elapsed() >= self.config.renew_deadline);
                        if deadline_passed {
                            warn!(
                                lease = %self.config.lease_name,
                                "Renew deadline exceeded without a successful renewal, demoting"
                            );
                            last_renew = None;
                            self.transition(LeaderState::Following);
                        }
                    }
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        if *self.state_tx.borrow() == LeaderState::Leading {
            self.release().await;
            self.transition(LeaderState::Following);
        }
        info!(lease = %self.config.lease_name, "Leader election stopped");
    }

    /// One acquire/renew attempt. `Ok(true)` means this instance holds the
    /// lease; `Ok(false)` means another holder was observed or won the CAS.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseStoreError::Unavailable`] when the store cannot be
    /// reached; CAS conflicts are folded into `Ok(false)`.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaseStoreError> {
        let now = Utc::now();
        let name = &self.config.lease_name;

        let (record, expected_version) = match self.store.get(name).await? {
            Some(existing) => {
                let held_by_us =
                    existing.record.holder.as_deref() == Some(self.config.identity.as_str());

                if !held_by_us && !existing.record.expired_at(now) {
                    debug!(
                        lease = %name,
                        holder = ?existing.record.holder,
                        "Lease held by another instance"
                    );
                    return Ok(false);
                }

                let record = if held_by_us {
                    LeaseRecord {
                        renewed_at: now,
                        ..existing.record
                    }
                } else {
                    LeaseRecord {
                        holder: Some(self.config.identity.clone()),
                        acquired_at: now,
                        renewed_at: now,
                        lease_duration_secs: self.config.lease_duration.as_secs(),
                        term: existing.record.term + 1,
                    }
                };
                (record, Some(existing.version))
            }
            None => (
                LeaseRecord {
                    holder: Some(self.config.identity.clone()),
                    acquired_at: now,
                    renewed_at: now,
                    lease_duration_secs: self.config.lease_duration.as_secs(),
                    term: 1,
                },
                None,
            ),
        };

        match self.store.put(name, record, expected_version).await {
            Ok(_) => Ok(true),
            Err(LeaseStoreError::Conflict) => {
                debug!(lease = %name, "Lost acquire race to another instance");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Deterministically release the lease if still held, shortening
    /// failover for the next leader. Best effort: failures are logged only.
    async fn release(&self) {
        let name = &self.config.lease_name;
        match self.store.get(name).await {
            Ok(Some(existing))
                if existing.record.holder.as_deref() == Some(self.config.identity.as_str()) =>
            {
                let released = LeaseRecord {
                    holder: None,
                    renewed_at: Utc::now(),
                    ..existing.record
                };
                match self.store.put(name, released, Some(existing.version)).await {
                    Ok(_) => info!(lease = %name, "Released lease on shutdown"),
                    Err(err) => warn!(lease = %name, error = %err, "Failed to release lease"),
                }
            }
            Ok(_) => {}
            Err(err) => warn!(lease = %name, error = %err, "Failed to read lease for release"),
        }
    }

    fn transition(&self, next: LeaderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match next {
                LeaderState::Leading => {
                    info!(identity = %self.config.identity, "Became leader");
                    self.metrics.leader.set(1);
                }
                LeaderState::Following => {
                    info!(identity = %self.config.identity, "Following; reconcile workers halted");
                    self.metrics.leader.set(0);
                }
                LeaderState::Pending => {}
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
#[path = "leader_tests.rs"]
mod leader_tests;
