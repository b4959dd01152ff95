//! OpenShift SecurityContextConstraints
//!
//! Grants the privileged node daemons their host access on OpenShift.
//! On plain Kubernetes both operations do nothing.

use kube::api::{Api, DynamicObject, Patch};
use serde_json::json;
use tracing::{debug, info};

use super::{
    apply_params, common_labels, delete_ignore_not_found, ownership_labels, topolvm_node,
    vg_manager, ResourceUnit, SharedContext,
};
use crate::controlplane::cluster_type::scc_api_resource;
use crate::crd::LVMCluster;
use crate::error::Result;

pub const NAME: &str = "openshift-security-context-constraints";

pub fn unit() -> ResourceUnit<SharedContext> {
    ResourceUnit::new(NAME, ensure_created, ensure_deleted)
}

/// SCC name per service account
pub fn scc_names() -> [(String, &'static str); 2] {
    [
        (format!("lvms-{}", topolvm_node::DAEMONSET_NAME), topolvm_node::DAEMONSET_NAME),
        (format!("lvms-{}", vg_manager::DAEMONSET_NAME), vg_manager::DAEMONSET_NAME),
    ]
}

/// Desired SCC admitting one service account
pub fn build(cluster: &LVMCluster, name: &str, namespace: &str, service_account: &str) -> DynamicObject {
    let mut labels = common_labels("lvms-scc");
    labels.extend(ownership_labels(cluster));

    let mut obj = DynamicObject::new(name, &scc_api_resource()).data(json!({
        "allowPrivilegedContainer": true,
        "allowPrivilegeEscalation": true,
        "allowHostDirVolumePlugin": true,
        "allowHostPID": true,
        "allowHostIPC": false,
        "allowHostNetwork": false,
        "allowHostPorts": false,
        "readOnlyRootFilesystem": false,
        "requiredDropCapabilities": [],
        "runAsUser": { "type": "RunAsAny" },
        "seLinuxContext": { "type": "RunAsAny" },
        "fsGroup": { "type": "RunAsAny" },
        "supplementalGroups": { "type": "RunAsAny" },
        "users": [format!("system:serviceaccount:{}:{}", namespace, service_account)],
        "volumes": ["configMap", "emptyDir", "hostPath", "secret"],
    }));
    obj.metadata.labels = Some(labels);
    obj
}

pub async fn ensure_created(ctx: SharedContext) -> Result<()> {
    if !ctx.cluster_type.is_openshift() {
        debug!("Not on OpenShift, skipping SCCs");
        return Ok(());
    }

    let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &scc_api_resource());
    for (name, service_account) in scc_names() {
        let scc = build(&ctx.cluster, &name, ctx.namespace(), service_account);
        api.patch(&name, &apply_params(), &Patch::Apply(&scc)).await?;
        debug!("Applied SecurityContextConstraints {}", name);
    }
    Ok(())
}

pub async fn ensure_deleted(ctx: SharedContext) -> Result<()> {
    if !ctx.cluster_type.is_openshift() {
        return Ok(());
    }

    let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &scc_api_resource());
    for (name, _) in scc_names() {
        delete_ignore_not_found(&api, &name).await?;
        info!("SecurityContextConstraints {} removed", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::units::testing;

    #[test]
    fn test_scc_per_daemon() {
        let names: Vec<_> = scc_names().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["lvms-topolvm-node", "lvms-vg-manager"]);
    }

    #[test]
    fn test_build_scc_admits_service_account() {
        let cluster = testing::cluster(vec![testing::thin_class("vg1", true)]);
        let scc = build(&cluster, "lvms-vg-manager", "openshift-storage", "vg-manager");

        assert_eq!(scc.data["allowPrivilegedContainer"], true);
        assert_eq!(
            scc.data["users"][0],
            "system:serviceaccount:openshift-storage:vg-manager"
        );
        let value = serde_json::to_value(&scc).unwrap();
        assert_eq!(value["kind"], "SecurityContextConstraints");
    }
}
