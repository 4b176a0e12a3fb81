// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! The controller manager: staged registration and the running task set.
//!
//! Construction is staged so each failure maps to a distinct exit code:
//! manager construction, controller registration, webhook registration,
//! health-check registration, and only then `run`. After `build` the kind
//! registry is frozen; nothing registers at runtime.
//!
//! `run` spawns the named task set: health server, webhook server when any
//! hooks were registered, leader elector, one watcher per kind, and the
//! scheduler with its worker pool. It tears everything down when the cancellation
//! token fires: watchers close their subscriptions, the scheduler stops
//! dequeuing and drains in-flight workers within a bounded window, and the
//! elector releases the lease.

use crate::admission::{
    serve_webhooks, webhook_router, AdmissionPipeline, MutatingHook, ValidatingHook,
};
use crate::cluster::ClusterStateSource;
use crate::constants::{DEFAULT_LEASE_NAME, DEFAULT_WORKER_COUNT};
use crate::context::{Context, Stores};
use crate::crd::KindId;
use crate::dispatch::Dispatcher;
use crate::error::StartupError;
use crate::health::{health_router, serve_health, Check, HealthChecks};
use crate::leader::{ElectionConfig, LeaderElector, LeaderState, LeaseStore};
use crate::metrics::Metrics;
use crate::queue::{default_stall_threshold, Scheduler, SchedulerConfig};
use crate::reconcilers::Reconciler;
use crate::registry::{DecodeFn, KindRegistry};
use crate::watch::run_watcher;
use anyhow::anyhow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Manager configuration, fixed before `run`.
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Bind address of the health probe server
    pub probe_addr: SocketAddr,
    /// Bind address of the webhook server
    pub webhook_addr: SocketAddr,
    /// Whether to run leader election; when off this instance always leads
    pub leader_election: bool,
    /// Election identity and timings
    pub election: ElectionConfig,
    /// Size of the reconcile worker pool
    pub worker_count: usize,
    /// Work queue behavior
    pub scheduler: SchedulerConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            probe_addr: ([0, 0, 0, 0], 8081).into(),
            webhook_addr: ([0, 0, 0, 0], 9443).into(),
            leader_election: false,
            election: ElectionConfig::new(DEFAULT_LEASE_NAME),
            worker_count: DEFAULT_WORKER_COUNT,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Staged manager builder; all registration happens here.
pub struct ManagerBuilder {
    options: ManagerOptions,
    cluster: Arc<dyn ClusterStateSource>,
    lease_store: Arc<dyn LeaseStore>,
    metrics: Arc<Metrics>,
    registry: crate::registry::RegistryBuilder,
    checks: HealthChecks,
}

impl ManagerBuilder {
    /// Register a controller for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Controller`] on duplicate registration.
    pub fn register_controller(
        &mut self,
        kind: KindId,
        decode: DecodeFn,
        reconciler: Arc<dyn Reconciler>,
    ) -> Result<(), StartupError> {
        let kind_name = kind.kind.clone();
        self.registry
            .register(kind, decode, reconciler)
            .map_err(|err| StartupError::Controller {
                kind: kind_name,
                reason: err.to_string(),
            })
    }

    /// Register admission hooks for an already-registered kind.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Webhook`] when the kind has no controller.
    pub fn register_webhook(
        &mut self,
        kind: &KindId,
        mutators: Vec<Arc<dyn MutatingHook>>,
        validators: Vec<Arc<dyn ValidatingHook>>,
    ) -> Result<(), StartupError> {
        self.registry
            .add_webhook(kind, mutators, validators)
            .map_err(|err| StartupError::Webhook {
                kind: kind.kind.clone(),
                reason: err.to_string(),
            })
    }

    /// Register a named liveness check.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::HealthCheck`] on duplicate names.
    pub fn add_healthz_check(&mut self, name: &str, check: Check) -> Result<(), StartupError> {
        self.checks
            .add_healthz(name, check)
            .map_err(|reason| StartupError::HealthCheck {
                name: name.to_string(),
                reason,
            })
    }

    /// Register a named readiness check.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::HealthCheck`] on duplicate names.
    pub fn add_readyz_check(&mut self, name: &str, check: Check) -> Result<(), StartupError> {
        self.checks
            .add_readyz(name, check)
            .map_err(|reason| StartupError::HealthCheck {
                name: name.to_string(),
                reason,
            })
    }

    /// Freeze the registry and assemble the manager.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Manager`] when assembly fails.
    pub fn build(self) -> Result<Manager, StartupError> {
        let registry = Arc::new(self.registry.build());
        let stores = Stores::new(registry.kinds());
        let ctx = Arc::new(Context {
            cluster: self.cluster,
            stores,
            metrics: Arc::clone(&self.metrics),
        });
        Ok(Manager {
            options: self.options,
            ctx,
            registry,
            lease_store: self.lease_store,
            metrics: self.metrics,
            checks: self.checks,
        })
    }
}

/// A fully configured controller manager.
pub struct Manager {
    options: ManagerOptions,
    ctx: Arc<Context>,
    registry: Arc<KindRegistry>,
    lease_store: Arc<dyn LeaseStore>,
    metrics: Arc<Metrics>,
    checks: HealthChecks,
}

impl Manager {
    /// Start building a manager.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Manager`] when core plumbing (metrics) cannot
    /// be constructed.
    pub fn builder(
        options: ManagerOptions,
        cluster: Arc<dyn ClusterStateSource>,
        lease_store: Arc<dyn LeaseStore>,
    ) -> Result<ManagerBuilder, StartupError> {
        let metrics =
            Arc::new(Metrics::new().map_err(|err| StartupError::Manager(err.to_string()))?);
        Ok(ManagerBuilder {
            options,
            cluster,
            lease_store,
            metrics,
            registry: KindRegistry::builder(),
            checks: HealthChecks::new(),
        })
    }

    /// Shared context, for tests and embedding.
    #[must_use]
    pub fn context(&self) -> Arc<Context> {
        Arc::clone(&self.ctx)
    }

    /// Run every component until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when a component exits unexpectedly; the caller maps
    /// this to the runtime exit code.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            leader_election = self.options.leader_election,
            workers = self.options.worker_count,
            "Starting manager"
        );

        // Leadership signal: a real elector when enabled, otherwise pinned
        // to Leading for the lifetime of the run.
        let mut pinned_leadership: Option<watch::Sender<LeaderState>> = None;
        let (leadership, elector) = if self.options.leader_election {
            let (elector, rx) = LeaderElector::new(
                Arc::clone(&self.lease_store),
                self.options.election.clone(),
                Arc::clone(&self.metrics),
            );
            (rx, Some(elector))
        } else {
            let (tx, rx) = watch::channel(LeaderState::Leading);
            pinned_leadership = Some(tx);
            (rx, None)
        };

        let scheduler = Arc::new(Scheduler::new(
            self.options.scheduler.clone(),
            Arc::clone(&self.metrics),
            cancel.clone(),
        ));

        self.register_builtin_checks(&scheduler, leadership.clone());
        let checks = Arc::new(self.checks);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.registry),
        ));

        let mut tasks: JoinSet<(&'static str, anyhow::Result<()>)> = JoinSet::new();

        {
            let router = health_router(Arc::clone(&checks), Arc::clone(&self.metrics));
            let addr = self.options.probe_addr;
            let cancel = cancel.clone();
            tasks.spawn(async move { ("health-server", serve_health(addr, router, cancel).await) });
        }

        if self.registry.webhook_kinds().next().is_some() {
            let pipeline = Arc::new(AdmissionPipeline::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
            ));
            let router = webhook_router(pipeline, &self.registry);
            let addr = self.options.webhook_addr;
            let cancel = cancel.clone();
            tasks.spawn(
                async move { ("webhook-server", serve_webhooks(addr, router, cancel).await) },
            );
        }

        if let Some(elector) = elector {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                elector.run(cancel).await;
                ("leader-elector", Ok(()))
            });
        }

        for kind in self.registry.kinds() {
            let ctx = Arc::clone(&self.ctx);
            let scheduler = Arc::clone(&scheduler);
            let kind = kind.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                run_watcher(ctx, scheduler, kind, cancel).await;
                ("watcher", Ok(()))
            });
        }

        {
            let scheduler = Arc::clone(&scheduler);
            let dispatcher = dispatcher;
            let leadership = leadership.clone();
            let cancel = cancel.clone();
            let workers = self.options.worker_count;
            tasks.spawn(async move {
                scheduler.run(workers, dispatcher, leadership, cancel).await;
                ("scheduler", Ok(()))
            });
        }

        let failure = tokio::select! {
            () = cancel.cancelled() => {
                info!("Shutdown signal received, stopping manager");
                None
            }
            joined = tasks.join_next() => {
                cancel.cancel();
                Some(match joined {
                    Some(Ok((name, Ok(())))) => anyhow!("{name} exited unexpectedly"),
                    Some(Ok((name, Err(err)))) => err.context(name),
                    Some(Err(join_err)) => anyhow!("manager task panicked: {join_err}"),
                    None => anyhow!("manager started with no tasks"),
                })
            }
        };

        // Bounded teardown: the scheduler drains its own workers within its
        // window, the elector releases the lease, servers stop accepting.
        let grace = self.options.scheduler.drain_timeout + Duration::from_secs(5);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, Err(err))) = joined {
                    warn!(task = name, error = %err, "Task failed during shutdown");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown grace period elapsed, aborting remaining tasks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        drop(pinned_leadership);

        match failure {
            Some(err) => {
                error!(error = %err, "Manager stopped after task failure");
                Err(err)
            }
            None => {
                info!("Manager stopped");
                Ok(())
            }
        }
    }

    /// Built-in probes: scheduler watchdog for liveness, store sync and
    /// leadership decision for readiness.
    fn register_builtin_checks(
        &mut self,
        scheduler: &Arc<Scheduler>,
        leadership: watch::Receiver<LeaderState>,
    ) {
        let watchdog = Arc::clone(scheduler);
        if let Err(err) = self.checks.add_healthz(
            "scheduler-watchdog",
            Box::new(move || {
                if watchdog.is_stalled(default_stall_threshold()) {
                    Err("scheduler heartbeat stalled".to_string())
                } else {
                    Ok(())
                }
            }),
        ) {
            warn!(error = %err, "Skipping built-in liveness check");
        }

        let stores = self.ctx.stores.clone();
        if let Err(err) = self.checks.add_readyz(
            "stores-synced",
            Box::new(move || {
                if stores.all_synced() {
                    Ok(())
                } else {
                    Err("object stores not yet synced".to_string())
                }
            }),
        ) {
            warn!(error = %err, "Skipping built-in readiness check");
        }

        if self.options.leader_election {
            if let Err(err) = self.checks.add_readyz(
                "leadership-decided",
                Box::new(move || match *leadership.borrow() {
                    LeaderState::Pending => Err("leadership not yet decided".to_string()),
                    LeaderState::Leading | LeaderState::Following => Ok(()),
                }),
            ) {
                warn!(error = %err, "Skipping built-in readiness check");
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
