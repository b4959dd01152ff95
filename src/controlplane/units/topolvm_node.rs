//! TopoLVM CSI node plugin DaemonSet

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, Patch};
use kube::core::ObjectMeta;
use tracing::debug;

use super::{
    apply_params, common_labels, daemon_affinity, daemon_tolerations, delete_ignore_not_found,
    field_env, host_path_volume, mount, owner_reference, sidecar, ResourceUnit, SharedContext,
    CSI_DRIVER_NAME,
};
use crate::controlplane::orchestrator::OrchestratorConfig;
use crate::crd::LVMCluster;
use crate::error::Result;

pub const NAME: &str = "topolvm-node";

/// DaemonSet and service account name
pub const DAEMONSET_NAME: &str = "topolvm-node";

const COMPONENT: &str = "topolvm-node";
const KUBELET_DIR: &str = "/var/lib/kubelet";
const PLUGIN_DIR: &str = "/var/lib/kubelet/plugins/topolvm.io/";
const HEALTH_PORT: i32 = 9808;

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

/// Desired node plugin DaemonSet
pub fn build(cluster: &LVMCluster, config: &OrchestratorConfig, image: &str) -> Result<DaemonSet> {
    let labels = common_labels(COMPONENT);
    let images = &config.images;
    let socket_arg = format!("--csi-address={}csi-topolvm.sock", PLUGIN_DIR);

    let node = Container {
        name: "topolvm-node".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "/topolvm-node".to_string(),
            "--embed-lvmd".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("healthz".to_string()),
            container_port: HEALTH_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(vec![field_env("NODE_NAME", "spec.nodeName")]),
        volume_mounts: Some(vec![
            mount("node-plugin-dir", PLUGIN_DIR),
            {
                let mut m = mount("pod-volumes-dir", &format!("{}/pods", KUBELET_DIR));
                m.mount_propagation = Some("Bidirectional".to_string());
                m
            },
            {
                let mut m = mount("csi-plugin-dir", &format!("{}/plugins/kubernetes.io/csi", KUBELET_DIR));
                m.mount_propagation = Some("Bidirectional".to_string());
                m
            },
            mount("devices", "/dev"),
            mount("lvmd-config-dir", "/etc/topolvm"),
        ]),
        ..Default::default()
    };

    let containers = vec![
        node,
        sidecar(
            "csi-registrar",
            &images.csi_registrar,
            &[
                socket_arg.clone(),
                format!(
                    "--kubelet-registration-path={}csi-topolvm.sock",
                    PLUGIN_DIR
                ),
            ],
            vec![
                mount("node-plugin-dir", PLUGIN_DIR),
                mount("registration-dir", "/registration"),
            ],
        ),
        sidecar(
            "liveness-probe",
            &images.csi_liveness_probe,
            &[socket_arg, format!("--http-endpoint=:{}", HEALTH_PORT)],
            vec![mount("node-plugin-dir", PLUGIN_DIR)],
        ),
    ];

    let volumes = vec![
        host_path_volume(
            "registration-dir",
            &format!("{}/plugins_registry/", KUBELET_DIR),
            "Directory",
        ),
        host_path_volume("node-plugin-dir", PLUGIN_DIR, "DirectoryOrCreate"),
        host_path_volume(
            "csi-plugin-dir",
            &format!("{}/plugins/kubernetes.io/csi", KUBELET_DIR),
            "DirectoryOrCreate",
        ),
        host_path_volume("pod-volumes-dir", &format!("{}/pods/", KUBELET_DIR), "DirectoryOrCreate"),
        host_path_volume("devices", "/dev", "Directory"),
        host_path_volume("lvmd-config-dir", "/etc/topolvm", "DirectoryOrCreate"),
    ];

    let mut template_labels = labels.clone();
    template_labels.insert("app.kubernetes.io/instance".to_string(), CSI_DRIVER_NAME.to_string());

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
                match_labels: Some(labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(DAEMONSET_NAME.to_string()),
                    host_pid: Some(true),
                    priority_class_name: Some("system-node-critical".to_string()),
                    tolerations: daemon_tolerations(cluster),
                    affinity: daemon_affinity(cluster),
                    containers,
                    volumes: Some(volumes),
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
    use k8s_openapi::api::core::v1::Toleration;

    #[test]
    fn test_build_daemonset() {
        let mut cluster = testing::cluster(vec![testing::thin_class("vg1", true)]);
        cluster.spec.tolerations = vec![Toleration {
            key: Some("node-role.kubernetes.io/storage".into()),
            operator: Some("Exists".into()),
            ..Default::default()
        }];

        let ds = build(&cluster, &OrchestratorConfig::default(), "img").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();

        assert_eq!(pod.tolerations.as_ref().map(|t| t.len()), Some(1));
        // A class without a node selector runs everywhere
        assert!(pod.affinity.is_none());

        let node = &pod.containers[0];
        assert_eq!(node.image.as_deref(), Some("img"));
        assert_eq!(
            node.security_context.as_ref().and_then(|s| s.privileged),
            Some(true)
        );
        let mounts: Vec<_> = node
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert!(mounts.contains(&"/dev"));
    }
}
