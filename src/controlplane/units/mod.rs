//! Resource Units
//!
//! One unit per managed artifact. Each unit is an independently idempotent
//! pair of `ensure_created` / `ensure_deleted` operations registered as a
//! descriptor, so the orchestrator iterates them uniformly:
//! - csi-driver: CSIDriver registration
//! - topolvm-controller: central CSI controller Deployment
//! - topolvm-node: CSI node plugin DaemonSet
//! - vg-manager: volume group manager DaemonSet
//! - lvmvolumegroups: per device class LVMVolumeGroup projection
//! - topolvm-storageclasses: StorageClass per device class
//! - topolvm-volumesnapshotclasses: VolumeSnapshotClass per thin device class
//! - openshift-security-context-constraints: SCCs on OpenShift

pub mod csi_driver;
pub mod scc;
pub mod snapshot_class;
pub mod storage_class;
pub mod topolvm_controller;
pub mod topolvm_node;
pub mod vg_manager;
pub mod volume_group;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, EnvVarSource, HostPathVolumeSource, NodeAffinity,
    ObjectFieldSelector, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, PatchParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::orchestrator::OrchestratorConfig;
use super::scheduling::merge_selectors;
use crate::crd::LVMCluster;
use crate::domain::ClusterType;
use crate::error::{is_kube_not_found, Error, Result};

/// Field manager for every server-side apply issued by the operator
pub const FIELD_MANAGER: &str = "lvms-operator";

/// Label naming the LVMCluster that owns a cluster-scoped object
pub const OWNED_BY_NAME_LABEL: &str = "lvm.topolvm.io/owned-by-name";

/// Label naming the namespace of the owning LVMCluster
pub const OWNED_BY_NAMESPACE_LABEL: &str = "lvm.topolvm.io/owned-by-namespace";

/// CSI driver name registered by the operator
pub const CSI_DRIVER_NAME: &str = "topolvm.io";

// =============================================================================
// Unit Context
// =============================================================================

/// Everything a unit needs for one reconcile pass
pub struct UnitContext {
    pub client: Client,
    pub cluster: Arc<LVMCluster>,
    pub config: Arc<OrchestratorConfig>,
    pub cluster_type: ClusterType,
    /// Image of the running operator, reused by the managed workloads
    pub image: String,
}

pub type SharedContext = Arc<UnitContext>;

impl UnitContext {
    /// Namespace the operator and its workloads live in
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Controller owner reference pointing at the LVMCluster
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        owner_reference(&self.cluster)
    }

    /// Labels shared by every object the operator manages
    pub fn common_labels(&self, component: &str) -> BTreeMap<String, String> {
        common_labels(component)
    }

    /// Labels tying a cluster-scoped object back to its LVMCluster
    pub fn ownership_labels(&self) -> BTreeMap<String, String> {
        ownership_labels(&self.cluster)
    }
}

// =============================================================================
// Unit Descriptor
// =============================================================================

pub type UnitFuture = BoxFuture<'static, Result<()>>;
pub type UnitFn<C> = Arc<dyn Fn(C) -> UnitFuture + Send + Sync>;

/// A named pair of idempotent create and delete operations
pub struct ResourceUnit<C> {
    name: &'static str,
    ensure_created: UnitFn<C>,
    ensure_deleted: UnitFn<C>,
}

impl<C> Clone for ResourceUnit<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            ensure_created: self.ensure_created.clone(),
            ensure_deleted: self.ensure_deleted.clone(),
        }
    }
}

impl<C: Send + 'static> ResourceUnit<C> {
    /// Build a unit from two async operations
    pub fn new<FC, FutC, FD, FutD>(name: &'static str, created: FC, deleted: FD) -> Self
    where
        FC: Fn(C) -> FutC + Send + Sync + 'static,
        FutC: Future<Output = Result<()>> + Send + 'static,
        FD: Fn(C) -> FutD + Send + Sync + 'static,
        FutD: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            ensure_created: Arc::new(move |ctx| Box::pin(created(ctx))),
            ensure_deleted: Arc::new(move |ctx| Box::pin(deleted(ctx))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ensure_created(&self, ctx: C) -> UnitFuture {
        (self.ensure_created)(ctx)
    }

    pub fn ensure_deleted(&self, ctx: C) -> UnitFuture {
        (self.ensure_deleted)(ctx)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Every unit, in the order they must be torn down
///
/// Creation ignores this order and runs them concurrently.
pub fn registry() -> Vec<ResourceUnit<SharedContext>> {
    vec![
        snapshot_class::unit(),
        storage_class::unit(),
        volume_group::unit(),
        topolvm_controller::unit(),
        csi_driver::unit(),
        scc::unit(),
        topolvm_node::unit(),
        vg_manager::unit(),
    ]
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Controller owner reference pointing at the LVMCluster
pub fn owner_reference(cluster: &LVMCluster) -> Result<OwnerReference> {
    cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingField {
            kind: "LVMCluster".to_string(),
            name: cluster.name_any(),
            field: "metadata.uid".to_string(),
        })
}

/// Labels shared by every object the operator manages
pub fn common_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), component.to_string()),
        ("app.kubernetes.io/part-of".to_string(), "lvms-provisioner".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
    ])
}

/// Labels tying a cluster-scoped object back to its LVMCluster
pub fn ownership_labels(cluster: &LVMCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNED_BY_NAME_LABEL.to_string(), cluster.name_any()),
        (
            OWNED_BY_NAMESPACE_LABEL.to_string(),
            cluster.namespace().unwrap_or_default(),
        ),
    ])
}

/// Tolerations the per-node daemons carry
pub fn daemon_tolerations(cluster: &LVMCluster) -> Option<Vec<Toleration>> {
    let tolerations = &cluster.spec.tolerations;
    (!tolerations.is_empty()).then(|| tolerations.clone())
}

/// Required node affinity covering the nodes of every device class
pub fn daemon_affinity(cluster: &LVMCluster) -> Option<Affinity> {
    let selector = merge_selectors(
        cluster
            .device_classes()
            .iter()
            .map(|dc| dc.node_selector.as_ref()),
    )?;
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Environment variable filled from a pod field
pub fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume mount at `path`
pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Volume backed by a host directory
pub fn host_path_volume(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

/// Plain sidecar container
pub fn sidecar(name: &str, image: &str, args: &[String], mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        args: Some(args.to_vec()),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

/// Parameters for a forced server-side apply
pub fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Delete an object, treating an already-missing one as success
pub async fn delete_ignore_not_found<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!("Deleted {}", name);
            Ok(())
        }
        Err(e) if is_kube_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::crd::{DeviceClass, DeviceSelector, LVMClusterSpec, Storage, ThinPoolConfig};
    use kube::core::ObjectMeta;

    pub fn thin_class(name: &str, default: bool) -> DeviceClass {
        DeviceClass {
            name: name.into(),
            device_selector: Some(DeviceSelector {
                paths: vec![format!("/dev/{}", name)],
                ..Default::default()
            }),
            thin_pool_config: Some(ThinPoolConfig {
                name: "thin-pool-1".into(),
                size_percent: 90,
                overprovision_ratio: 10,
                chunk_size_calculation_policy: Default::default(),
                chunk_size: None,
                metadata_size_calculation_policy: Default::default(),
                metadata_size: None,
            }),
            default,
            fstype: "xfs".into(),
            ..Default::default()
        }
    }

    pub fn cluster(device_classes: Vec<DeviceClass>) -> LVMCluster {
        LVMCluster {
            metadata: ObjectMeta {
                name: Some("my-lvmcluster".into()),
                namespace: Some("openshift-storage".into()),
                uid: Some("2f0c6b1e-3b47-4a5e-9c1b-8f5d2c1a0e11".into()),
                ..Default::default()
            },
            spec: LVMClusterSpec {
                tolerations: vec![],
                storage: Storage { device_classes },
            },
            status: None,
        }
    }
}
