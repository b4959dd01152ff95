//! LVMVolumeGroup projection
//!
//! Projects every device class onto one LVMVolumeGroup consumed by the node
//! agents. Teardown is two-phase: the operator first deletes the objects,
//! then releases their finalizer once the agents have stopped reporting the
//! volume group in the LVMCluster status.

use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::{delete_ignore_not_found, owner_reference, ResourceUnit, SharedContext};
use crate::crd::{
    DeviceClass, LVMCluster, LVMVolumeGroup, LVMVolumeGroupSpec, VOLUME_GROUP_FINALIZER,
};
use crate::error::{Error, Result};

pub const NAME: &str = "lvmvolumegroups";

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

// =============================================================================
// Projection
// =============================================================================

/// Desired LVMVolumeGroup for one device class
pub fn desired_volume_group(
    cluster: &LVMCluster,
    device_class: &DeviceClass,
    namespace: &str,
) -> Result<LVMVolumeGroup> {
    Ok(LVMVolumeGroup {
        metadata: ObjectMeta {
            name: Some(device_class.name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner_reference(cluster)?]),
            finalizers: Some(vec![VOLUME_GROUP_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: LVMVolumeGroupSpec {
            device_selector: device_class.device_selector.clone(),
            node_selector: device_class.node_selector.clone(),
            thin_pool_config: device_class.thin_pool_config.clone(),
            default: cluster.is_default_device_class(device_class),
            device_discovery_policy: device_class.device_discovery_policy,
        },
    })
}

/// Whether the stored object differs from the desired one in anything the
/// operator owns
pub fn volume_group_needs_update(existing: &LVMVolumeGroup, desired: &LVMVolumeGroup) -> bool {
    if existing.spec != desired.spec {
        return true;
    }
    if !existing.finalizers().iter().any(|f| f == VOLUME_GROUP_FINALIZER) {
        return true;
    }
    let existing_owners = existing.owner_references();
    !desired
        .owner_references()
        .iter()
        .all(|owner| existing_owners.iter().any(|o| o.uid == owner.uid))
}

/// Fold the desired state into the stored object
fn merge_into(existing: &LVMVolumeGroup, desired: &LVMVolumeGroup) -> LVMVolumeGroup {
    let mut merged = existing.clone();
    merged.spec = desired.spec.clone();

    let finalizers = merged.finalizers_mut();
    if !finalizers.iter().any(|f| f == VOLUME_GROUP_FINALIZER) {
        finalizers.push(VOLUME_GROUP_FINALIZER.to_string());
    }

    let owners = merged.owner_references_mut();
    for owner in desired.owner_references() {
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner.clone());
        }
    }
    merged
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    let api: Api<LVMVolumeGroup> = Api::namespaced(ctx.client.clone(), ctx.namespace());

    for device_class in ctx.cluster.device_classes() {
        let desired = desired_volume_group(&ctx.cluster, device_class, ctx.namespace())?;
        let name = device_class.name.as_str();

        match api.get_opt(name).await? {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!("Created LVMVolumeGroup {}", name);
            }
            Some(existing) if existing.meta().deletion_timestamp.is_some() => {
                warn!("LVMVolumeGroup {} is being deleted, not updating it", name);
            }
            Some(existing) if volume_group_needs_update(&existing, &desired) => {
                let merged = merge_into(&existing, &desired);
                api.replace(name, &PostParams::default(), &merged).await?;
                info!("Updated LVMVolumeGroup {}", name);
            }
            Some(_) => debug!("LVMVolumeGroup {} is up to date", name),
        }
    }
    Ok(())
}

// =============================================================================
// Teardown
// =============================================================================

/// What a teardown pass does with each volume group
#[derive(Debug, Default, PartialEq)]
pub struct TeardownPlan {
    /// Not yet marked for deletion
    pub delete: Vec<String>,
    /// Marked for deletion and no longer reported by any agent
    pub release: Vec<String>,
    /// Still held by the finalizer after this pass
    pub pending: Vec<String>,
}

/// Decide the teardown step of every volume group
///
/// `reported` lists the volume groups still present in the LVMCluster status.
pub fn plan_teardown(volume_groups: &[LVMVolumeGroup], reported: &[&str]) -> TeardownPlan {
    let mut plan = TeardownPlan::default();

    for vg in volume_groups {
        let name = vg.name_any();
        let guarded = vg.finalizers().iter().any(|f| f == VOLUME_GROUP_FINALIZER);

        if vg.meta().deletion_timestamp.is_none() {
            plan.delete.push(name.clone());
            if guarded {
                plan.pending.push(name);
            }
        } else if guarded {
            if reported.contains(&name.as_str()) {
                plan.pending.push(name);
            } else {
                plan.release.push(name);
            }
        }
    }

    plan.pending.sort();
    plan
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    let api: Api<LVMVolumeGroup> = Api::namespaced(ctx.client.clone(), ctx.namespace());
    let cluster_uid = ctx.cluster.uid();

    let owned: Vec<LVMVolumeGroup> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|vg| {
            vg.owner_references()
                .iter()
                .any(|o| Some(&o.uid) == cluster_uid.as_ref())
        })
        .collect();

    let plan = plan_teardown(&owned, &ctx.cluster.reported_volume_groups());

    for name in &plan.delete {
        delete_ignore_not_found(&api, name).await?;
        info!("Requested deletion of LVMVolumeGroup {}", name);
    }

    for name in &plan.release {
        let Some(vg) = owned.iter().find(|vg| vg.name_any() == *name) else {
            continue;
        };
        release_finalizer(&api, vg).await?;
        info!("Released finalizer of LVMVolumeGroup {}", name);
    }

    if !plan.pending.is_empty() {
        return Err(Error::VolumeGroupsPending {
            names: plan.pending,
        });
    }
    Ok(())
}

async fn release_finalizer(api: &Api<LVMVolumeGroup>, vg: &LVMVolumeGroup) -> Result<()> {
    let finalizers: Vec<&String> = vg
        .finalizers()
        .iter()
        .filter(|f| *f != VOLUME_GROUP_FINALIZER)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });

    match api
        .patch(&vg.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if crate::error::is_kube_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::units::testing;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const NAMESPACE: &str = "openshift-storage";

    #[test]
    fn test_single_class_projected_as_default() {
        let cluster = testing::cluster(vec![testing::thin_class("vg1", false)]);
        let vg = desired_volume_group(&cluster, &cluster.device_classes()[0], NAMESPACE).unwrap();

        assert!(vg.spec.default);
        assert_eq!(vg.name_any(), "vg1");
        assert_eq!(vg.finalizers(), &[VOLUME_GROUP_FINALIZER.to_string()]);
        assert_eq!(vg.owner_references()[0].name, "my-lvmcluster");
        assert_eq!(vg.spec.thin_pool_config, cluster.device_classes()[0].thin_pool_config);
    }

    #[test]
    fn test_default_follows_flag_with_multiple_classes() {
        let cluster = testing::cluster(vec![
            testing::thin_class("vg1", false),
            testing::thin_class("vg2", true),
        ]);
        let vg1 = desired_volume_group(&cluster, &cluster.device_classes()[0], NAMESPACE).unwrap();
        let vg2 = desired_volume_group(&cluster, &cluster.device_classes()[1], NAMESPACE).unwrap();
        assert!(!vg1.spec.default);
        assert!(vg2.spec.default);
    }

    #[test]
    fn test_unchanged_volume_group_needs_no_update() {
        let cluster = testing::cluster(vec![testing::thin_class("vg1", true)]);
        let desired = desired_volume_group(&cluster, &cluster.device_classes()[0], NAMESPACE).unwrap();

        // What the API server hands back carries server-side metadata
        let mut stored = desired.clone();
        stored.metadata.resource_version = Some("4711".into());
        stored.metadata.uid = Some("b7c5d3a0".into());

        assert!(!volume_group_needs_update(&stored, &desired));
    }

    #[test]
    fn test_spec_drift_needs_update() {
        let cluster = testing::cluster(vec![testing::thin_class("vg1", true)]);
        let desired = desired_volume_group(&cluster, &cluster.device_classes()[0], NAMESPACE).unwrap();

        let mut stored = desired.clone();
        stored.spec.default = false;
        assert!(volume_group_needs_update(&stored, &desired));

        let mut stored = desired.clone();
        stored.metadata.finalizers = None;
        assert!(volume_group_needs_update(&stored, &desired));

        let mut stored = desired.clone();
        stored.metadata.owner_references = None;
        assert!(volume_group_needs_update(&stored, &desired));

        let merged = merge_into(&stored, &desired);
        assert!(!volume_group_needs_update(&merged, &desired));
    }

    fn stored(name: &str, deleting: bool, guarded: bool) -> LVMVolumeGroup {
        let mut vg = LVMVolumeGroup::new(name, LVMVolumeGroupSpec::default());
        if deleting {
            vg.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        if guarded {
            vg.metadata.finalizers = Some(vec![VOLUME_GROUP_FINALIZER.to_string()]);
        }
        vg
    }

    #[test]
    fn test_first_teardown_pass_deletes_everything() {
        let vgs = vec![stored("vg1", false, true), stored("vg2", false, true)];
        let plan = plan_teardown(&vgs, &["vg1", "vg2"]);

        assert_eq!(plan.delete, vec!["vg1", "vg2"]);
        assert!(plan.release.is_empty());
        assert_eq!(plan.pending, vec!["vg1", "vg2"]);
    }

    #[test]
    fn test_finalizer_released_only_after_retraction() {
        let vgs = vec![stored("vg1", true, true), stored("vg2", true, true)];
        let plan = plan_teardown(&vgs, &["vg2"]);

        assert!(plan.delete.is_empty());
        assert_eq!(plan.release, vec!["vg1"]);
        assert_eq!(plan.pending, vec!["vg2"]);

        let plan = plan_teardown(&vgs, &[]);
        assert_eq!(plan.release, vec!["vg1", "vg2"]);
        assert!(plan.pending.is_empty());
    }

    #[test]
    fn test_unguarded_volume_groups_never_pending() {
        let vgs = vec![stored("vg1", false, false), stored("vg2", true, false)];
        let plan = plan_teardown(&vgs, &["vg1", "vg2"]);

        assert_eq!(plan.delete, vec!["vg1"]);
        assert!(plan.release.is_empty());
        assert!(plan.pending.is_empty());
    }
}
