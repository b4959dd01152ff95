//! VolumeSnapshotClass per thin device class
//!
//! The snapshot API ships with the external snapshot controller and may be
//! missing, so the unit goes through the dynamic API and treats an absent
//! resource type as nothing to do.

use kube::api::{Api, ApiResource, DynamicObject, Patch};
use kube::core::GroupVersionKind;
use serde_json::json;
use tracing::{debug, info};

use super::storage_class::storage_class_name;
use super::{
    apply_params, common_labels, ownership_labels, ResourceUnit, SharedContext, CSI_DRIVER_NAME,
};
use crate::crd::{DeviceClass, LVMCluster};
use crate::error::{is_kube_not_found, Result};

pub const NAME: &str = "topolvm-volumesnapshotclasses";

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

/// ApiResource for snapshot.storage.k8s.io VolumeSnapshotClass
pub fn snapshot_class_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotClass"),
        "volumesnapshotclasses",
    )
}

/// Device classes that get a snapshot class
pub fn snapshot_capable(cluster: &LVMCluster) -> impl Iterator<Item = &DeviceClass> {
    cluster.device_classes().iter().filter(|dc| dc.is_thin())
}

/// Desired VolumeSnapshotClass for one thin device class
pub fn build(cluster: &LVMCluster, device_class: &DeviceClass) -> DynamicObject {
    let mut labels = common_labels("topolvm-volumesnapshotclass");
    labels.extend(ownership_labels(cluster));

    let mut obj = DynamicObject::new(
        &storage_class_name(&device_class.name),
        &snapshot_class_api_resource(),
    )
    .data(json!({
        "driver": CSI_DRIVER_NAME,
        "deletionPolicy": "Delete",
    }));
    obj.metadata.labels = Some(labels);
    obj
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    let api: Api<DynamicObject> =
        Api::all_with(ctx.client.clone(), &snapshot_class_api_resource());

    for device_class in snapshot_capable(&ctx.cluster) {
        let name = storage_class_name(&device_class.name);
        let obj = build(&ctx.cluster, device_class);
        match api.patch(&name, &apply_params(), &Patch::Apply(&obj)).await {
            Ok(_) => debug!("Applied VolumeSnapshotClass {}", name),
            Err(e) if is_kube_not_found(&e) => {
                info!("VolumeSnapshotClass API not installed, skipping snapshot classes");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    let api: Api<DynamicObject> =
        Api::all_with(ctx.client.clone(), &snapshot_class_api_resource());

    for device_class in snapshot_capable(&ctx.cluster) {
        let name = storage_class_name(&device_class.name);
        match api.delete(&name, &Default::default()).await {
            Ok(_) => info!("VolumeSnapshotClass {} removed", name),
            // Covers both a missing object and a missing API
            Err(e) if is_kube_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
