//! Main Orchestrator - The "Brain"
//!
//! Drives one reconcile pass of the LVMCluster:
//! - Singleton enforcement across all namespaces
//! - Cluster type and operator image resolution
//! - Concurrent resource unit creation or ordered teardown
//! - The LVMCluster finalizer protocol
//! - Status recomputation after every pass

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::cluster_type::ClusterTypeResolver;
use super::metrics::OperatorMetrics;
use super::status;
use super::units::{self, ResourceUnit, SharedContext, UnitContext, FIELD_MANAGER};
use crate::crd::{LVMCluster, LVMClusterStatus, CLUSTER_FINALIZER};
use crate::error::{is_kube_not_found, Error, Result};

/// Container of the operator pod whose image the managed workloads reuse
pub const MANAGER_CONTAINER: &str = "manager";

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Images of the CSI sidecars deployed next to the TopoLVM components
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub csi_provisioner: String,
    pub csi_resizer: String,
    pub csi_snapshotter: String,
    pub csi_registrar: String,
    pub csi_liveness_probe: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            csi_provisioner: "registry.k8s.io/sig-storage/csi-provisioner:v4.0.0".to_string(),
            csi_resizer: "registry.k8s.io/sig-storage/csi-resizer:v1.10.0".to_string(),
            csi_snapshotter: "registry.k8s.io/sig-storage/csi-snapshotter:v7.0.1".to_string(),
            csi_registrar: "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.10.0"
                .to_string(),
            csi_liveness_probe: "registry.k8s.io/sig-storage/livenessprobe:v2.12.0".to_string(),
        }
    }
}

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Namespace the operator, its workloads and the LVMCluster live in
    pub namespace: String,
    /// Name of the operator pod, used to look up the operator image
    pub pod_name: Option<String>,
    /// Explicit operator image, skips the pod lookup
    pub operator_image: Option<String>,
    /// Sidecar images
    pub images: ImageConfig,
    /// Requeue interval after a successful pass
    pub resync_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "openshift-storage".to_string(),
            pod_name: None,
            operator_image: None,
            images: ImageConfig::default(),
            resync_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Unit Fan-out
// =============================================================================

/// Run `ensure_created` of every unit concurrently
///
/// Every unit runs to completion regardless of the others; all failures are
/// joined into one error. A panicking unit counts as a failure of that unit.
pub async fn run_create<C>(units: &[ResourceUnit<C>], ctx: C) -> Result<()>
where
    C: Clone + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for unit in units {
        let name = unit.name();
        let fut = unit.ensure_created(ctx.clone());
        tasks.spawn(async move { (name, fut.await) });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(e))) => {
                warn!("Resource unit {} failed: {}", name, e);
                failures.push(Error::unit(name, e));
            }
            Err(join_err) => {
                error!("Resource unit task aborted: {}", join_err);
                failures.push(Error::Internal(format!(
                    "resource unit task aborted: {}",
                    join_err
                )));
            }
        }
    }

    match failures.len() {
        0 => Ok(()),
        _ => Err(Error::Aggregate(failures)),
    }
}

/// Run `ensure_deleted` of every unit in the given order
///
/// Stops at the first failing unit; later units are not touched.
pub async fn run_delete<C>(units: &[ResourceUnit<C>], ctx: C) -> Result<()>
where
    C: Clone + Send + 'static,
{
    for unit in units {
        debug!("Tearing down resource unit {}", unit.name());
        unit.ensure_deleted(ctx.clone())
            .await
            .map_err(|e| Error::unit(unit.name(), e))?;
    }
    Ok(())
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Main orchestrator that coordinates one reconcile pass
pub struct Orchestrator {
    client: Client,
    config: Arc<OrchestratorConfig>,
    resolver: Arc<ClusterTypeResolver>,
    metrics: Arc<OperatorMetrics>,
    units: Vec<ResourceUnit<SharedContext>>,
    reporter: Reporter,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        client: Client,
        config: OrchestratorConfig,
        resolver: Arc<ClusterTypeResolver>,
        metrics: Arc<OperatorMetrics>,
    ) -> Arc<Self> {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: config.pod_name.clone(),
        };

        Arc::new(Self {
            client,
            config: Arc::new(config),
            resolver,
            metrics,
            units: units::registry(),
            reporter,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    /// Run one full pass for the given LVMCluster
    ///
    /// Status is recomputed after the spec phase whatever its outcome; a spec
    /// error is reported in preference to a status write error.
    pub async fn reconcile(&self, cluster: &LVMCluster) -> Result<Action> {
        self.verify_single_cluster().await?;

        let namespace = cluster.namespace().unwrap_or_else(|| self.config.namespace.clone());
        let api: Api<LVMCluster> = Api::namespaced(self.client.clone(), &namespace);
        let Some(current) = api.get_opt(&cluster.name_any()).await? else {
            debug!("LVMCluster {} no longer exists", cluster.name_any());
            return Ok(Action::await_change());
        };

        let outcome = self.sync(&current).await;

        let reconcile_error = outcome.as_ref().err().map(|e| e.to_string());
        let status = status::update_status(&self.client, &current, reconcile_error.as_deref()).await;

        if let Ok(written) = &status {
            self.metrics.set_ready(written.ready);
        }
        pass_result(outcome, status)
    }

    /// Reconcile the desired state, without touching status
    async fn sync(&self, cluster: &LVMCluster) -> Result<Action> {
        let cluster_type = self.resolver.resolve().await?;
        let image = self.resolve_image().await?;

        let ctx: SharedContext = Arc::new(UnitContext {
            client: self.client.clone(),
            cluster: Arc::new(cluster.clone()),
            config: self.config.clone(),
            cluster_type,
            image,
        });

        if cluster.meta().deletion_timestamp.is_some() {
            self.cleanup(ctx).await
        } else {
            self.apply(ctx).await
        }
    }

    /// Create or update every managed resource
    async fn apply(&self, ctx: SharedContext) -> Result<Action> {
        let cluster = ctx.cluster.clone();
        if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
            self.add_finalizer(&cluster).await?;
        }

        let start = Instant::now();
        let result = run_create(&self.units, ctx).await;
        self.metrics.observe_duration(start.elapsed());

        if let Err(Error::Aggregate(failures)) = &result {
            for failure in failures {
                if let Error::UnitFailed { unit, .. } = failure {
                    self.metrics.record_unit_failure(unit);
                }
            }
        }
        result?;

        info!(
            "Reconciled LVMCluster {} in {:?}",
            cluster.name_any(),
            start.elapsed()
        );
        Ok(Action::requeue(self.config.resync_interval))
    }

    /// Tear everything down once no logical volume depends on the cluster
    async fn cleanup(&self, ctx: SharedContext) -> Result<Action> {
        let cluster = ctx.cluster.clone();
        if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
            return Ok(Action::await_change());
        }

        let count = self.count_logical_volumes(&cluster).await?;
        if count > 0 {
            info!(
                "LVMCluster {} still has {} logical volume(s), waiting",
                cluster.name_any(),
                count
            );
            return Err(Error::VolumesPending { count });
        }

        run_delete(&self.units, ctx).await?;

        self.remove_finalizer(&cluster).await?;
        self.publish_event(
            &cluster,
            EventType::Normal,
            "FinalizerRemoved",
            "Deleted all managed resources".to_string(),
        )
        .await;
        info!("Cleaned up LVMCluster {}", cluster.name_any());
        Ok(Action::await_change())
    }

    // =========================================================================
    // Pass Preconditions
    // =========================================================================

    /// Refuse to act while more than one LVMCluster exists anywhere
    async fn verify_single_cluster(&self) -> Result<()> {
        let api: Api<LVMCluster> = Api::all(self.client.clone());
        let count = api.list(&ListParams::default()).await?.items.len();
        if count > 1 {
            return Err(Error::MultipleClusters { count });
        }
        Ok(())
    }

    /// Image of the running operator
    async fn resolve_image(&self) -> Result<String> {
        if let Some(image) = &self.config.operator_image {
            return Ok(image.clone());
        }

        let pod_name = self
            .config
            .pod_name
            .as_deref()
            .ok_or_else(|| Error::OwnImage("POD_NAME is not set".to_string()))?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pod = pods
            .get_opt(pod_name)
            .await?
            .ok_or_else(|| Error::OwnImage(format!("operator pod {} not found", pod_name)))?;

        image_from_pod(&pod)
            .ok_or_else(|| Error::OwnImage(format!("operator pod {} has no container image", pod_name)))
    }

    /// Number of logical volumes provisioned from this cluster's device classes
    async fn count_logical_volumes(&self, cluster: &LVMCluster) -> Result<usize> {
        let resource = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("topolvm.io", "v1", "LogicalVolume"),
            "logicalvolumes",
        );
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let volumes = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            // No TopoLVM CRDs installed means no volumes
            Err(e) if is_kube_not_found(&e) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let classes: HashSet<&str> = cluster
            .device_classes()
            .iter()
            .map(|dc| dc.name.as_str())
            .collect();
        Ok(count_volumes_in_classes(&volumes, &classes))
    }

    // =========================================================================
    // Finalizer
    // =========================================================================

    async fn add_finalizer(&self, cluster: &LVMCluster) -> Result<()> {
        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(CLUSTER_FINALIZER.to_string());
        self.patch_finalizers(cluster, finalizers).await?;
        info!("Added finalizer to LVMCluster {}", cluster.name_any());
        Ok(())
    }

    async fn remove_finalizer(&self, cluster: &LVMCluster) -> Result<()> {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != CLUSTER_FINALIZER)
            .cloned()
            .collect();
        match self.patch_finalizers(cluster, finalizers).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn patch_finalizers(&self, cluster: &LVMCluster, finalizers: Vec<String>) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| self.config.namespace.clone());
        let api: Api<LVMCluster> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Publish a Kubernetes event on the LVMCluster; failures are only logged
    pub async fn publish_event(
        &self,
        cluster: &LVMCluster,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            cluster.object_ref(&()),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("Failed to publish event for {}: {}", cluster.name_any(), e);
        }
    }
}

/// Image of the manager container, or of the first container
fn image_from_pod(pod: &Pod) -> Option<String> {
    let containers = &pod.spec.as_ref()?.containers;
    containers
        .iter()
        .find(|c| c.name == MANAGER_CONTAINER)
        .or_else(|| containers.first())
        .and_then(|c| c.image.clone())
}

/// Combine the pass outcome with the status write
///
/// A failed pass wins over a failed status write.
pub fn pass_result(outcome: Result<Action>, status: Result<LVMClusterStatus>) -> Result<Action> {
    match (outcome, status) {
        (Err(e), Err(status_err)) => {
            warn!("Status update failed after a failed pass: {}", status_err);
            Err(e)
        }
        (Err(e), Ok(_)) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(action), Ok(_)) => Ok(action),
    }
}

/// Count logical volumes whose `spec.deviceClass` is one of `classes`
fn count_volumes_in_classes(volumes: &[DynamicObject], classes: &HashSet<&str>) -> usize {
    volumes
        .iter()
        .filter(|lv| {
            lv.data
                .pointer("/spec/deviceClass")
                .and_then(|v| v.as_str())
                .map_or(false, |dc| classes.contains(dc))
        })
        .count()
}
