//! Volume group manager DaemonSet
//!
//! Runs the node agent (the operator image in `vgmanager` mode) that turns
//! LVMVolumeGroup objects into LVM volume groups and reports back through
//! LVMVolumeGroupNodeStatus.

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch};
use kube::core::ObjectMeta;
use tracing::debug;

use super::{
    apply_params, common_labels, daemon_affinity, daemon_tolerations, delete_ignore_not_found,
    field_env, host_path_volume, mount, owner_reference, ResourceUnit, SharedContext,
};
use crate::controlplane::orchestrator::OrchestratorConfig;
use crate::crd::LVMCluster;
use crate::error::Result;

pub const NAME: &str = "vg-manager";

/// DaemonSet and service account name
pub const DAEMONSET_NAME: &str = "vg-manager";

const COMPONENT: &str = "vg-manager";

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

/// Desired vg-manager DaemonSet
pub fn build(cluster: &LVMCluster, config: &OrchestratorConfig, image: &str) -> Result<DaemonSet> {
    let labels = common_labels(COMPONENT);

    let probe = |path: &str| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(8081),
            ..Default::default()
        }),
        initial_delay_seconds: Some(2),
        period_seconds: Some(30),
        ..Default::default()
    };

    let manager = Container {
        name: "vg-manager".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["/lvms".to_string(), "vgmanager".to_string()]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(vec![
            field_env("NODE_NAME", "spec.nodeName"),
            field_env("NAMESPACE", "metadata.namespace"),
        ]),
        liveness_probe: Some(probe("/healthz")),
        readiness_probe: Some(probe("/readyz")),
        volume_mounts: Some(vec![
            mount("device-dir", "/dev"),
            mount("run-udev", "/run/udev"),
            mount("lvmd-config", "/etc/topolvm"),
            mount("lvm-config", "/etc/lvm"),
        ]),
        ..Default::default()
    };

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(DAEMONSET_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(DAEMONSET_NAME.to_string()),
                    host_pid: Some(true),
                    priority_class_name: Some("openshift-user-critical".to_string()),
                    tolerations: daemon_tolerations(cluster),
                    affinity: daemon_affinity(cluster),
                    containers: vec![manager],
                    volumes: Some(vec![
                        host_path_volume("device-dir", "/dev", "Directory"),
                        host_path_volume("run-udev", "/run/udev", "Directory"),
                        host_path_volume("lvmd-config", "/etc/topolvm", "DirectoryOrCreate"),
                        host_path_volume("lvm-config", "/etc/lvm", "DirectoryOrCreate"),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    let daemonset = build(&ctx.cluster, &ctx.config, &ctx.image)?;
    let api: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), ctx.namespace());
    api.patch(DAEMONSET_NAME, &apply_params(), &Patch::Apply(&daemonset))
        .await?;
    debug!("Applied DaemonSet {}", DAEMONSET_NAME);
    Ok(())
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    let api: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), ctx.namespace());
    delete_ignore_not_found(&api, DAEMONSET_NAME).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::units::testing;
    use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};

    #[test]
    fn test_build_vg_manager() {
        let mut dc = testing::thin_class("vg1", true);
        dc.node_selector = Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "node-role.kubernetes.io/worker".into(),
                    operator: "Exists".into(),
                    values: None,
                }]),
                match_fields: None,
            }],
        });
        let cluster = testing::cluster(vec![dc]);

        let ds = build(&cluster, &OrchestratorConfig::default(), "img").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];

        assert_eq!(
            container.command,
            Some(vec!["/lvms".to_string(), "vgmanager".to_string()])
        );
        let env: Vec<_> = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(env, vec!["NODE_NAME", "NAMESPACE"]);
        assert!(pod.tolerations.is_none());

        let terms = pod
            .affinity
            .and_then(|a| a.node_affinity)
            .and_then(|n| n.required_during_scheduling_ignored_during_execution)
            .map(|s| s.node_selector_terms);
        assert_eq!(terms.map(|t| t.len()), Some(1));
    }
}
