// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! End-to-end tests for the manager: watch → queue → dispatch flow,
//! requeue-after timing, the deletion path and leadership failover.

mod common;

use atrk::cluster::ClusterStateSource;
use atrk::crd::App;
use atrk::leader::{LeaseRecord, LeaseStore};
use atrk::manager::Manager;
use atrk::mem::{MemoryCluster, MemoryLeaseStore};
use atrk::reconcilers::Action;
use chrono::Utc;
use common::{app_object, fast_options, wait_until, RecordingReconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn spawn_manager(
    cluster: &Arc<MemoryCluster>,
    leases: &Arc<MemoryLeaseStore>,
    reconciler: &Arc<RecordingReconciler>,
    options: atrk::manager::ManagerOptions,
) -> (CancellationToken, JoinHandle<anyhow::Result<()>>) {
    let mut builder = Manager::builder(
        options,
        Arc::clone(cluster) as Arc<dyn atrk::cluster::ClusterStateSource>,
        Arc::clone(leases) as Arc<dyn LeaseStore>,
    )
    .expect("manager construction");
    builder
        .register_controller(
            App::kind_id(),
            App::decode,
            Arc::clone(reconciler) as Arc<dyn atrk::reconcilers::Reconciler>,
        )
        .expect("controller registration");
    let manager = builder.build().expect("manager build");

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(manager.run(cancel.clone()));
    (cancel, handle)
}

/// Object created → watch event → enqueue → dispatch reads current state →
/// `RequeueAfter` honored no earlier than requested.
#[tokio::test(flavor = "multi_thread")]
async fn end_to_end_create_then_requeue_after() {
    let cluster = Arc::new(MemoryCluster::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let reconciler = RecordingReconciler::new(vec![Action::RequeueAfter(Duration::from_millis(
        300,
    ))]);

    let (cancel, handle) = spawn_manager(
        &cluster,
        &leases,
        &reconciler,
        fast_options(false, "e2e-a", "m1"),
    );

    cluster.apply(app_object("web", "prod", "nginx:1.27"));

    assert!(
        wait_until(
            || reconciler.reconcile_calls().len() == 1,
            Duration::from_secs(3)
        )
        .await,
        "object must be dispatched after creation"
    );

    assert!(
        wait_until(
            || reconciler.reconcile_calls().len() >= 2,
            Duration::from_secs(3)
        )
        .await,
        "requeue-after must re-dispatch"
    );

    let calls = reconciler.reconcile_calls();
    let gap = calls[1].at.duration_since(calls[0].at);
    assert!(
        gap >= Duration::from_millis(300),
        "re-dispatched earlier than requested: {gap:?}"
    );
    assert_eq!(calls[0].key.to_string(), "App/prod/web");
    assert_eq!(calls[0].resource_version, calls[1].resource_version);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

/// State is re-read at dispatch time: an update made while a long
/// requeue-after timer is pending reconciles the current object promptly.
#[tokio::test(flavor = "multi_thread")]
async fn update_during_requeue_reconciles_current_state() {
    let cluster = Arc::new(MemoryCluster::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let reconciler =
        RecordingReconciler::new(vec![Action::RequeueAfter(Duration::from_secs(600))]);

    let (cancel, handle) = spawn_manager(
        &cluster,
        &leases,
        &reconciler,
        fast_options(false, "e2e-b", "m1"),
    );

    cluster.apply(app_object("web", "prod", "nginx:1.27"));
    assert!(
        wait_until(
            || reconciler.reconcile_calls().len() == 1,
            Duration::from_secs(3)
        )
        .await
    );

    // Change the object long before the 10-minute timer could fire.
    cluster.apply(app_object("web", "prod", "nginx:1.28"));
    assert!(
        wait_until(
            || reconciler.reconcile_calls().len() >= 2,
            Duration::from_secs(3)
        )
        .await,
        "update must trigger a prompt re-dispatch"
    );

    let key = app_object("web", "prod", "nginx:1.27").key();
    let current = cluster
        .get(&App::kind_id(), &key)
        .await
        .unwrap()
        .unwrap()
        .metadata
        .resource_version;
    let calls = reconciler.reconcile_calls();
    assert_eq!(
        calls[1].resource_version, current,
        "second dispatch must observe the updated object"
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

/// Deleting an object after it was enqueued but before dispatch results in
/// exactly one deletion-path invocation and no requeue.
#[tokio::test(flavor = "multi_thread")]
async fn delete_before_dispatch_finalizes_once() {
    let cluster = Arc::new(MemoryCluster::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let reconciler = RecordingReconciler::new(Vec::new());

    // Hold the lease elsewhere so workers stay gated while we create and
    // delete the object; the stale record expires ~200ms in.
    let stale = LeaseRecord {
        holder: Some("previous-leader".to_string()),
        acquired_at: Utc::now(),
        renewed_at: Utc::now() - chrono::Duration::milliseconds(800),
        lease_duration_secs: 1,
        term: 1,
    };
    leases.put("e2e-c", stale, None).await.unwrap();

    let (cancel, handle) = spawn_manager(
        &cluster,
        &leases,
        &reconciler,
        fast_options(true, "e2e-c", "m1"),
    );

    let obj = app_object("doomed", "prod", "nginx:1.27");
    let key = obj.key();
    cluster.apply(obj);
    cluster.delete(&App::kind_id(), &key);

    assert!(
        wait_until(
            || reconciler.finalize_calls().len() == 1,
            Duration::from_secs(5)
        )
        .await,
        "deletion path must run after leadership is acquired"
    );

    // Nothing further: no reconcile of the live path, no second finalize.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(reconciler.finalize_calls().len(), 1);
    assert!(reconciler.reconcile_calls().is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

/// Two replicas contend for one lease: only the leader reconciles, and a
/// graceful shutdown hands leadership to the follower.
#[tokio::test(flavor = "multi_thread")]
async fn leadership_failover_between_managers() {
    let cluster = Arc::new(MemoryCluster::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let first = RecordingReconciler::new(Vec::new());
    let second = RecordingReconciler::new(Vec::new());

    let (cancel1, handle1) = spawn_manager(
        &cluster,
        &leases,
        &first,
        fast_options(true, "e2e-d", "replica-one"),
    );

    cluster.apply(app_object("web", "prod", "nginx:1.27"));
    assert!(
        wait_until(|| first.reconcile_calls().len() >= 1, Duration::from_secs(3)).await,
        "first replica must win the uncontended lease and reconcile"
    );

    let (cancel2, handle2) = spawn_manager(
        &cluster,
        &leases,
        &second,
        fast_options(true, "e2e-d", "replica-two"),
    );

    // The follower watches but must not reconcile while the leader holds on.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        second.reconcile_calls().is_empty(),
        "follower must not reconcile while the lease is held"
    );

    // Graceful shutdown releases the lease; the follower takes over well
    // within lease TTL + one retry period.
    cancel1.cancel();
    handle1.await.unwrap().unwrap();

    assert!(
        wait_until(
            || !second.reconcile_calls().is_empty(),
            Duration::from_secs(3)
        )
        .await,
        "follower must take over after the lease is released"
    );

    cancel2.cancel();
    handle2.await.unwrap().unwrap();
}
