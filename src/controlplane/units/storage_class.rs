//! StorageClass per device class

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, Patch};
use kube::core::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{
    apply_params, common_labels, delete_ignore_not_found, ownership_labels, ResourceUnit,
    SharedContext, CSI_DRIVER_NAME, OWNED_BY_NAME_LABEL,
};
use crate::crd::{DeviceClass, LVMCluster};
use crate::error::Result;

pub const NAME: &str = "topolvm-storageclasses";

/// Prefix of every StorageClass the operator creates
pub const STORAGE_CLASS_PREFIX: &str = "lvms-";

pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";
pub const DEVICE_CLASS_PARAMETER: &str = "topolvm.io/device-class";
pub const FSTYPE_PARAMETER: &str = "csi.storage.k8s.io/fstype";

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

pub fn storage_class_name(device_class: &str) -> String {
    format!("{}{}", STORAGE_CLASS_PREFIX, device_class)
}

fn is_annotated_default(sc: &StorageClass) -> bool {
    sc.annotations()
        .get(DEFAULT_CLASS_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// Whether a StorageClass outside the operator's control is already the
/// cluster default
pub fn foreign_default_exists(existing: &[StorageClass]) -> bool {
    existing.iter().any(|sc| {
        is_annotated_default(sc)
            && !sc.labels().contains_key(OWNED_BY_NAME_LABEL)
            && !sc.name_any().starts_with(STORAGE_CLASS_PREFIX)
    })
}

/// Desired StorageClass for one device class
pub fn build(cluster: &LVMCluster, device_class: &DeviceClass, mark_default: bool) -> StorageClass {
    let options = device_class.storage_class_options.clone().unwrap_or_default();

    let mut labels = common_labels("topolvm-storageclass");
    labels.extend(ownership_labels(cluster));
    labels.extend(options.additional_labels);

    let mut parameters = options.additional_parameters;
    parameters.insert(DEVICE_CLASS_PARAMETER.to_string(), device_class.name.clone());
    parameters.insert(FSTYPE_PARAMETER.to_string(), device_class.fstype.clone());

    let annotations = mark_default.then(|| {
        BTreeMap::from([(DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string())])
    });

    StorageClass {
        metadata: ObjectMeta {
            name: Some(storage_class_name(&device_class.name)),
            labels: Some(labels),
            annotations,
            ..Default::default()
        },
        provisioner: CSI_DRIVER_NAME.to_string(),
        parameters: Some(parameters),
        reclaim_policy: Some(options.reclaim_policy.unwrap_or_else(|| "Delete".to_string())),
        volume_binding_mode: Some(
            options
                .volume_binding_mode
                .unwrap_or_else(|| "WaitForFirstConsumer".to_string()),
        ),
        allow_volume_expansion: Some(true),
        ..Default::default()
    }
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    let api: Api<StorageClass> = Api::all(ctx.client.clone());
    let existing = api.list(&ListParams::default()).await?.items;
    let foreign_default = foreign_default_exists(&existing);

    for device_class in ctx.cluster.device_classes() {
        let mark_default = !foreign_default && ctx.cluster.is_default_device_class(device_class);
        let sc = build(&ctx.cluster, device_class, mark_default);
        let name = storage_class_name(&device_class.name);

        api.patch(&name, &apply_params(), &Patch::Apply(&sc)).await?;
        debug!("Applied StorageClass {} (default: {})", name, mark_default);
    }
    Ok(())
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    let api: Api<StorageClass> = Api::all(ctx.client.clone());
    for device_class in ctx.cluster.device_classes() {
        let name = storage_class_name(&device_class.name);
        delete_ignore_not_found(&api, &name).await?;
        info!("StorageClass {} removed", name);
    }
    Ok(())
}
