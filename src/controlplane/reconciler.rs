//! LVMCluster Controller
//!
//! Wires the orchestrator into the kube-runtime controller loop: watches the
//! LVMCluster plus everything it owns, records pass outcomes and maps errors
//! to requeue decisions.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::metrics::{RESULT_ERROR, RESULT_SUCCESS, RESULT_WAITING};
use super::orchestrator::Orchestrator;
use crate::crd::{LVMCluster, LVMVolumeGroup, LVMVolumeGroupNodeStatus};
use crate::error::{Error, ErrorAction, Result};

/// First retry delay after a failed pass
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound for retry delays
const MAX_BACKOFF: Duration = Duration::from_secs(300);

// =============================================================================
// Backoff Tracking
// =============================================================================

/// Per-object exponential backoff, reset after a successful pass
pub struct BackoffTracker {
    entries: DashMap<String, ExponentialBackoff>,
    initial: Duration,
    max: Duration,
    randomization: f64,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF, 0.1)
    }
}

impl BackoffTracker {
    pub fn new(initial: Duration, max: Duration, randomization: f64) -> Self {
        Self {
            entries: DashMap::new(),
            initial,
            max,
            randomization,
        }
    }

    fn fresh(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max)
            .with_randomization_factor(self.randomization)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Next delay for `key`
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| self.fresh());
        entry.next_backoff().unwrap_or(self.max)
    }

    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Requeue decision for a failed pass
pub fn requeue_action(error: &Error, backoffs: &BackoffTracker, key: &str) -> Action {
    match error.action() {
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::RequeueWithBackoff => Action::requeue(backoffs.next_delay(key)),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

fn object_key(cluster: &LVMCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

// =============================================================================
// Controller
// =============================================================================

/// Context shared by every reconcile call
pub struct Context {
    pub orchestrator: Arc<Orchestrator>,
    pub backoffs: BackoffTracker,
}

impl Context {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            backoffs: BackoffTracker::default(),
        })
    }
}

#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<LVMCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let metrics = ctx.orchestrator.metrics();
    let result = ctx.orchestrator.reconcile(&cluster).await;

    match &result {
        Ok(_) => {
            metrics.record_reconcile(RESULT_SUCCESS);
            ctx.backoffs.reset(&object_key(&cluster));
            debug!("Pass finished in {:?}", start.elapsed());
        }
        Err(e) if e.is_waiting() => {
            metrics.record_reconcile(RESULT_WAITING);
            info!("Waiting on external state: {}", e);
        }
        Err(e) => {
            metrics.record_reconcile(RESULT_ERROR);
            ctx.orchestrator
                .publish_event(&cluster, EventType::Warning, "ReconcileFailed", e.to_string())
                .await;
        }
    }
    result
}

fn error_policy(cluster: Arc<LVMCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&cluster);
    let action = requeue_action(error, &ctx.backoffs, &key);
    warn!(error = %error, ?action, "Reconciliation error for '{}'", key);
    action
}

/// Run the LVMCluster controller until a shutdown signal arrives
pub async fn run_controller(client: Client, orchestrator: Arc<Orchestrator>) {
    let namespace = orchestrator.config().namespace.clone();
    let ctx = Context::new(orchestrator);

    let clusters: Api<LVMCluster> = Api::all(client.clone());
    let volume_groups: Api<LVMVolumeGroup> = Api::namespaced(client.clone(), &namespace);
    let node_statuses: Api<LVMVolumeGroupNodeStatus> = Api::namespaced(client.clone(), &namespace);
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
    let deployments: Api<Deployment> = Api::namespaced(client, &namespace);

    info!("Starting LVMCluster controller in namespace {}", namespace);

    let controller = Controller::new(clusters, Config::default());
    let store = controller.store();

    controller
        .owns(volume_groups, Config::default())
        .owns(daemonsets, Config::default())
        .owns(deployments, Config::default())
        // Node reports carry no owner; any of them may change the cluster status
        .watches(node_statuses, Config::default(), move |_| {
            store
                .state()
                .into_iter()
                .map(|cluster| ObjectRef::from_obj(&*cluster))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "Reconciliation completed"),
                Err(e) => error!(error = %e, "Reconciliation failed"),
            }
        })
        .await;

    info!("LVMCluster controller stopped");
}
