//! TopoLVM CSI controller Deployment
//!
//! Runs the central CSI controller from the operator image together with the
//! upstream provisioner, resizer, snapshotter and liveness sidecars.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch};
use kube::core::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use super::{
    apply_params, common_labels, delete_ignore_not_found, field_env, mount, owner_reference,
    sidecar, ResourceUnit, SharedContext,
};
use crate::controlplane::orchestrator::OrchestratorConfig;
use crate::crd::LVMCluster;
use crate::error::Result;

pub const NAME: &str = "topolvm-controller";

/// Deployment and service account name
pub const DEPLOYMENT_NAME: &str = "topolvm-controller";

const COMPONENT: &str = "topolvm-controller";
const SOCKET_DIR: &str = "/run/topolvm";
const CSI_SOCKET_ARG: &str = "--csi-address=/run/topolvm/csi-topolvm.sock";
const HEALTH_PORT: i32 = 9808;

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

/// Desired controller Deployment
pub fn build(cluster: &LVMCluster, config: &OrchestratorConfig, image: &str) -> Result<Deployment> {
    let labels = common_labels(COMPONENT);
    let images = &config.images;
    let socket_mount = || vec![mount("socket-dir", SOCKET_DIR)];

    let controller = Container {
        name: "topolvm-controller".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["/topolvm-controller".to_string()]),
        args: Some(vec!["--enable-webhooks=false".to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some("healthz".to_string()),
            container_port: HEALTH_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::String("healthz".to_string()),
                ..Default::default()
            }),
            failure_threshold: Some(3),
            initial_delay_seconds: Some(10),
            period_seconds: Some(60),
            timeout_seconds: Some(3),
            ..Default::default()
        }),
        env: Some(vec![field_env("NAMESPACE", "metadata.namespace")]),
        volume_mounts: Some(socket_mount()),
        ..Default::default()
    };

    let mut provisioner = sidecar(
        "csi-provisioner",
        &images.csi_provisioner,
        &[
            CSI_SOCKET_ARG.to_string(),
            "--enable-capacity".to_string(),
            "--capacity-ownerref-level=2".to_string(),
            "--capacity-poll-interval=30s".to_string(),
            "--feature-gates=Topology=true".to_string(),
        ],
        socket_mount(),
    );
    provisioner.env = Some(vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("NAMESPACE", "metadata.namespace"),
    ]);

    let containers = vec![
        controller,
        provisioner,
        sidecar(
            "csi-resizer",
            &images.csi_resizer,
            &[CSI_SOCKET_ARG.to_string()],
            socket_mount(),
        ),
        sidecar(
            "csi-snapshotter",
            &images.csi_snapshotter,
            &[CSI_SOCKET_ARG.to_string()],
            socket_mount(),
        ),
        sidecar(
            "liveness-probe",
            &images.csi_liveness_probe,
            &[
                CSI_SOCKET_ARG.to_string(),
                format!("--http-endpoint=:{}", HEALTH_PORT),
            ],
            socket_mount(),
        ),
    ];

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(DEPLOYMENT_NAME.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(DEPLOYMENT_NAME.to_string()),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    containers,
                    volumes: Some(vec![Volume {
                        name: "socket-dir".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    let deployment = build(&ctx.cluster, &ctx.config, &ctx.image)?;
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), ctx.namespace());
    api.patch(DEPLOYMENT_NAME, &apply_params(), &Patch::Apply(&deployment))
        .await?;
    debug!("Applied Deployment {} for {}", DEPLOYMENT_NAME, ctx.cluster.name_any());
    Ok(())
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), ctx.namespace());
    delete_ignore_not_found(&api, DEPLOYMENT_NAME).await
}
