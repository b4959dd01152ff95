//! Status aggregation
//!
//! Folds the per-node volume group reports written by the node agents into
//! the single readiness state carried on the LVMCluster.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::scheduling::{has_no_schedule_taint, selector_matches};
use crate::crd::{
    DeviceClass, DeviceClassStatus, LVMCluster, LVMClusterState, LVMClusterStatus,
    LVMVolumeGroupNodeStatus, NodeStatus, VGStatusType,
};
use crate::error::{is_kube_not_found, Error, Result};

/// Condition reporting whether every resource unit succeeded
pub const CONDITION_RESOURCES_AVAILABLE: &str = "ResourcesAvailable";

/// Condition reporting whether every expected volume group is ready
pub const CONDITION_VOLUME_GROUPS_READY: &str = "VolumeGroupsReady";

// =============================================================================
// Expected Volume Groups
// =============================================================================

/// Number of volume groups the node agents should eventually report Ready
///
/// Every device class contributes one volume group per schedulable node its
/// selector matches.
pub fn expected_vg_count(device_classes: &[DeviceClass], nodes: &[Node]) -> usize {
    device_classes
        .iter()
        .map(|dc| {
            nodes
                .iter()
                .filter(|node| !has_no_schedule_taint(node))
                .filter(|node| selector_matches(dc.node_selector.as_ref(), node))
                .count()
        })
        .sum()
}

// =============================================================================
// Aggregation
// =============================================================================

/// Result of folding the node reports
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedStatus {
    pub state: LVMClusterState,
    pub ready: bool,
    pub device_class_statuses: Vec<DeviceClassStatus>,
}

/// Derive the cluster state from every node report
///
/// Failed wins over Degraded, which wins over Ready. Ready additionally
/// requires the number of Ready volume groups to equal `expected`.
pub fn aggregate(reports: &[LVMVolumeGroupNodeStatus], expected: usize) -> AggregatedStatus {
    let mut failed = false;
    let mut degraded = false;
    let mut ready_count = 0usize;
    let mut by_class: BTreeMap<String, Vec<NodeStatus>> = BTreeMap::new();

    for report in reports {
        let node = report.name_any();
        for vg in &report.spec.node_status {
            match vg.status {
                VGStatusType::Failed => failed = true,
                VGStatusType::Degraded => degraded = true,
                VGStatusType::Ready => ready_count += 1,
                VGStatusType::Progressing => {}
            }

            by_class.entry(vg.name.clone()).or_default().push(NodeStatus {
                node: node.clone(),
                status: vg.status,
                reason: vg.reason.clone(),
                devices: vg.devices.clone(),
                excluded: vg.excluded.clone(),
            });
        }
    }

    let state = if failed {
        LVMClusterState::Failed
    } else if degraded {
        LVMClusterState::Degraded
    } else if ready_count > 0 && ready_count == expected {
        LVMClusterState::Ready
    } else {
        LVMClusterState::Progressing
    };

    let device_class_statuses = by_class
        .into_iter()
        .map(|(name, mut node_status)| {
            node_status.sort_by(|a, b| a.node.cmp(&b.node));
            DeviceClassStatus { name, node_status }
        })
        .collect();

    AggregatedStatus {
        state,
        ready: state == LVMClusterState::Ready,
        device_class_statuses,
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Insert or replace a condition, keeping its transition time when the
/// status did not flip
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

fn condition(
    type_: &str,
    ok: bool,
    reason: &str,
    message: String,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(now),
        observed_generation: generation,
    }
}

/// Compute the full status for one pass
///
/// `reconcile_error` carries the message of a failed pass, if any.
pub fn compute_status(
    cluster: &LVMCluster,
    reports: &[LVMVolumeGroupNodeStatus],
    nodes: &[Node],
    reconcile_error: Option<&str>,
    now: DateTime<Utc>,
) -> LVMClusterStatus {
    let expected = expected_vg_count(cluster.device_classes(), nodes);
    let aggregated = aggregate(reports, expected);
    let generation = cluster.metadata.generation;

    let mut conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let resources = match reconcile_error {
        None => condition(
            CONDITION_RESOURCES_AVAILABLE,
            true,
            "ReconcileSucceeded",
            "Reconciliation is complete and all the resources are available".to_string(),
            generation,
            now,
        ),
        Some(message) => condition(
            CONDITION_RESOURCES_AVAILABLE,
            false,
            "ReconcileFailed",
            message.to_string(),
            generation,
            now,
        ),
    };
    set_condition(&mut conditions, resources);

    let vg_message = if aggregated.ready {
        "All the volume groups are ready".to_string()
    } else {
        format!("Volume groups are {}", aggregated.state)
    };
    let volume_groups = condition(
        CONDITION_VOLUME_GROUPS_READY,
        aggregated.ready,
        if aggregated.ready {
            "VolumeGroupsReady"
        } else {
            state_reason(aggregated.state)
        },
        vg_message,
        generation,
        now,
    );
    set_condition(&mut conditions, volume_groups);

    LVMClusterStatus {
        ready: aggregated.ready,
        state: aggregated.state,
        conditions,
        device_class_statuses: aggregated.device_class_statuses,
    }
}

fn state_reason(state: LVMClusterState) -> &'static str {
    match state {
        LVMClusterState::Progressing => "Progressing",
        LVMClusterState::Ready => "Ready",
        LVMClusterState::Failed => "Failed",
        LVMClusterState::Degraded => "Degraded",
        LVMClusterState::Unknown => "Unknown",
    }
}

// =============================================================================
// Status Writer
// =============================================================================

/// Merge patch body for the status subresource
///
/// Lists are always present, so an empty list replaces the stored one.
pub fn status_patch(status: &LVMClusterStatus) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

/// Recompute and write the status of the LVMCluster
///
/// Always patches the status subresource. A cluster that vanished in the
/// meantime is not an error.
pub async fn update_status(
    client: &Client,
    cluster: &LVMCluster,
    reconcile_error: Option<&str>,
) -> Result<LVMClusterStatus> {
    let namespace = cluster.namespace().ok_or_else(|| Error::MissingField {
        kind: "LVMCluster".to_string(),
        name: cluster.name_any(),
        field: "metadata.namespace".to_string(),
    })?;

    let reports: Api<LVMVolumeGroupNodeStatus> = Api::namespaced(client.clone(), &namespace);
    let reports = reports.list(&ListParams::default()).await?.items;

    let nodes: Api<Node> = Api::all(client.clone());
    let nodes = nodes.list(&ListParams::default()).await?.items;

    let status = compute_status(cluster, &reports, &nodes, reconcile_error, Utc::now());
    debug!(
        "Computed status for LVMCluster {}: state={}, device classes={}",
        cluster.name_any(),
        status.state,
        status.device_class_statuses.len()
    );

    let api: Api<LVMCluster> = Api::namespaced(client.clone(), &namespace);
    let patch = status_patch(&status);
    match api
        .patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(e) if is_kube_not_found(&e) => {
            info!("LVMCluster {} is gone, skipping status update", cluster.name_any());
        }
        Err(e) => return Err(e.into()),
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LVMClusterSpec, LVMVolumeGroupNodeStatusSpec, Storage, VGStatus};
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use kube::core::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tainted(name: &str) -> Node {
        let mut n = node(name);
        n.spec = Some(NodeSpec {
            taints: Some(vec![Taint {
                key: "node-role.kubernetes.io/master".into(),
                effect: "NoSchedule".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        n
    }

    fn report(node: &str, vgs: &[(&str, VGStatusType)]) -> LVMVolumeGroupNodeStatus {
        let mut r = LVMVolumeGroupNodeStatus::new(
            node,
            LVMVolumeGroupNodeStatusSpec {
                node_status: vgs
                    .iter()
                    .map(|(name, status)| VGStatus {
                        name: name.to_string(),
                        status: *status,
                        reason: String::new(),
                        devices: vec!["/dev/sdb".into()],
                        excluded: vec![],
                        device_discovery_policy: None,
                    })
                    .collect(),
            },
        );
        r.metadata.namespace = Some("openshift-storage".into());
        r
    }

    fn cluster(names: &[&str]) -> LVMCluster {
        let mut c = LVMCluster::new(
            "lvmcluster",
            LVMClusterSpec {
                tolerations: vec![],
                storage: Storage {
                    device_classes: names
                        .iter()
                        .map(|n| DeviceClass {
                            name: n.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                },
            },
        );
        c.metadata.generation = Some(3);
        c
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_expected_count_skips_no_schedule_nodes() {
        let classes = cluster(&["vg1", "vg2"]).spec.storage.device_classes;
        let nodes = vec![node("worker-0"), node("worker-1"), tainted("master-0")];
        assert_eq!(expected_vg_count(&classes, &nodes), 4);
    }

    #[test]
    fn test_all_ready_nodes_give_ready() {
        let reports = vec![
            report("worker-0", &[("vg1", VGStatusType::Ready)]),
            report("worker-1", &[("vg1", VGStatusType::Ready)]),
        ];
        let result = aggregate(&reports, 2);
        assert_eq!(result.state, LVMClusterState::Ready);
        assert!(result.ready);
    }

    #[test]
    fn test_single_failed_node_fails_cluster() {
        let reports = vec![
            report("worker-0", &[("vg1", VGStatusType::Ready)]),
            report("worker-1", &[("vg1", VGStatusType::Failed)]),
        ];
        let result = aggregate(&reports, 2);
        assert_eq!(result.state, LVMClusterState::Failed);
        assert!(!result.ready);
    }

    #[test]
    fn test_failed_takes_precedence_over_degraded() {
        let reports = vec![
            report("worker-0", &[("vg1", VGStatusType::Degraded)]),
            report("worker-1", &[("vg1", VGStatusType::Failed)]),
        ];
        assert_eq!(aggregate(&reports, 2).state, LVMClusterState::Failed);

        let reports = vec![
            report("worker-0", &[("vg1", VGStatusType::Degraded)]),
            report("worker-1", &[("vg1", VGStatusType::Ready)]),
        ];
        assert_eq!(aggregate(&reports, 2).state, LVMClusterState::Degraded);
    }

    #[test]
    fn test_partial_ready_is_progressing() {
        let reports = vec![report("worker-0", &[("vg1", VGStatusType::Ready)])];
        assert_eq!(aggregate(&reports, 2).state, LVMClusterState::Progressing);
        assert_eq!(aggregate(&[], 0).state, LVMClusterState::Progressing);
    }

    #[test]
    fn test_device_class_statuses_grouped_and_sorted() {
        let reports = vec![
            report("worker-1", &[("vg2", VGStatusType::Ready), ("vg1", VGStatusType::Progressing)]),
            report("worker-0", &[("vg1", VGStatusType::Ready)]),
        ];
        let result = aggregate(&reports, 3);
        let names: Vec<_> = result.device_class_statuses.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["vg1", "vg2"]);

        let vg1_nodes: Vec<_> = result.device_class_statuses[0]
            .node_status
            .iter()
            .map(|n| n.node.as_str())
            .collect();
        assert_eq!(vg1_nodes, vec!["worker-0", "worker-1"]);
    }

    #[test]
    fn test_compute_status_conditions() {
        let c = cluster(&["vg1"]);
        let reports = vec![report("worker-0", &[("vg1", VGStatusType::Ready)])];
        let status = compute_status(&c, &reports, &[node("worker-0")], None, now());

        assert!(status.ready);
        assert_eq!(status.conditions.len(), 2);
        let resources = &status.conditions[0];
        assert_eq!(resources.type_, CONDITION_RESOURCES_AVAILABLE);
        assert_eq!(resources.status, "True");
        assert_eq!(resources.observed_generation, Some(3));

        let status = compute_status(&c, &reports, &[node("worker-0")], Some("boom"), now());
        assert_eq!(status.conditions[0].status, "False");
        assert_eq!(status.conditions[0].message, "boom");
    }

    #[test]
    fn test_status_patch_clears_retracted_volume_groups() {
        let mut c = cluster(&["vg1"]);
        let reports = vec![report("worker-0", &[("vg1", VGStatusType::Ready)])];
        c.status = Some(compute_status(&c, &reports, &[node("worker-0")], None, now()));
        assert_eq!(c.reported_volume_groups(), vec!["vg1"]);

        // Agents retracted every report
        let status = compute_status(&c, &[], &[], None, now());
        let patch = status_patch(&status);
        assert_eq!(patch["status"]["deviceClassStatuses"], serde_json::json!([]));
        assert!(patch["status"]["conditions"].is_array());

        let written: LVMClusterStatus = serde_json::from_value(patch["status"].clone()).unwrap();
        c.status = Some(written);
        assert!(c.reported_volume_groups().is_empty());
    }

    #[test]
    fn test_empty_lists_always_serialized() {
        let value = serde_json::to_value(LVMClusterStatus::default()).unwrap();
        assert_eq!(value["conditions"], serde_json::json!([]));
        assert_eq!(value["deviceClassStatuses"], serde_json::json!([]));
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut conditions = Vec::new();
        let first = condition("X", true, "R", "m".into(), None, now());
        set_condition(&mut conditions, first);

        let later = now() + chrono::Duration::minutes(5);
        set_condition(&mut conditions, condition("X", true, "R", "m2".into(), None, later));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Time(now()));
        assert_eq!(conditions[0].message, "m2");

        set_condition(&mut conditions, condition("X", false, "R", "m3".into(), None, later));
        assert_eq!(conditions[0].last_transition_time, Time(later));
    }
}
