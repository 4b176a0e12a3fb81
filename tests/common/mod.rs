// Common test utilities for integration tests

use async_trait::async_trait;
use atrk::context::Context;
use atrk::crd::{DynamicObject, ObjectKey};
use atrk::leader::ElectionConfig;
use atrk::manager::ManagerOptions;
use atrk::queue::SchedulerConfig;
use atrk::reconcilers::{Action, Reconciler, ReconcileError};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Build an `App` object envelope.
pub fn app_object(name: &str, namespace: &str, image: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "atro.xyz/v1alpha1",
        "kind": "App",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {"image": image}
    }))
    .expect("valid app object")
}

/// Manager options tuned for fast tests: ephemeral ports, millisecond
/// election timings, no retry jitter.
pub fn fast_options(leader_election: bool, lease_name: &str, identity: &str) -> ManagerOptions {
    ManagerOptions {
        probe_addr: ([127, 0, 0, 1], 0).into(),
        webhook_addr: ([127, 0, 0, 1], 0).into(),
        leader_election,
        election: ElectionConfig {
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_millis(400),
            renew_deadline: Duration::from_millis(250),
            retry_period: Duration::from_millis(30),
        },
        worker_count: 2,
        scheduler: SchedulerConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
            drain_timeout: Duration::from_secs(1),
        },
    }
}

/// A call observed by the recording reconciler.
#[derive(Clone, Debug)]
pub struct ObservedCall {
    pub key: ObjectKey,
    pub resource_version: Option<String>,
    pub at: Instant,
}

/// Reconciler that records every invocation and replays a scripted action
/// sequence; once the script is exhausted it returns `Done`.
pub struct RecordingReconciler {
    script: Mutex<VecDeque<Action>>,
    reconcile_calls: Mutex<Vec<ObservedCall>>,
    finalize_calls: Mutex<Vec<ObjectKey>>,
}

impl RecordingReconciler {
    pub fn new(script: Vec<Action>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            reconcile_calls: Mutex::new(Vec::new()),
            finalize_calls: Mutex::new(Vec::new()),
        })
    }

    pub fn reconcile_calls(&self) -> Vec<ObservedCall> {
        self.reconcile_calls.lock().expect("poisoned").clone()
    }

    pub fn finalize_calls(&self) -> Vec<ObjectKey> {
        self.finalize_calls.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(
        &self,
        _ctx: Arc<Context>,
        obj: Arc<DynamicObject>,
    ) -> Result<Action, ReconcileError> {
        self.reconcile_calls.lock().expect("poisoned").push(ObservedCall {
            key: obj.key(),
            resource_version: obj.metadata.resource_version.clone(),
            at: Instant::now(),
        });
        Ok(self
            .script
            .lock()
            .expect("poisoned")
            .pop_front()
            .unwrap_or(Action::Done))
    }

    async fn finalize(&self, _ctx: Arc<Context>, key: &ObjectKey) -> Result<(), ReconcileError> {
        self.finalize_calls.lock().expect("poisoned").push(key.clone());
        Ok(())
    }
}

/// Poll until the condition holds or the timeout elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
