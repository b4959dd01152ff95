//! CSIDriver registration for TopoLVM

use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use kube::api::{Api, Patch};
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use tracing::info;

use super::{
    apply_params, delete_ignore_not_found, ResourceUnit, SharedContext, CSI_DRIVER_NAME,
};
use crate::error::Result;

pub const NAME: &str = "csi-driver";

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

/// Desired CSIDriver object
pub fn build(labels: BTreeMap<String, String>) -> CSIDriver {
    CSIDriver {
        metadata: ObjectMeta {
            name: Some(CSI_DRIVER_NAME.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: CSIDriverSpec {
            attach_required: Some(false),
            pod_info_on_mount: Some(true),
            storage_capacity: Some(true),
            volume_lifecycle_modes: Some(vec![
                "Persistent".to_string(),
                "Ephemeral".to_string(),
            ]),
            ..Default::default()
        },
    }
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    let mut labels = ctx.common_labels("topolvm-csi-driver");
    labels.extend(ctx.ownership_labels());

    let api: Api<CSIDriver> = Api::all(ctx.client.clone());
    api.patch(CSI_DRIVER_NAME, &apply_params(), &Patch::Apply(&build(labels)))
        .await?;
    Ok(())
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    let api: Api<CSIDriver> = Api::all(ctx.client.clone());
    delete_ignore_not_found(&api, CSI_DRIVER_NAME).await?;
    info!("CSIDriver {} removed", CSI_DRIVER_NAME);
    Ok(())
}
