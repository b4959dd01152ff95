//! Custom Resource Definitions for the LVMS Operator
//!
//! This module contains all CRD types:
//! - LVMCluster: Desired storage topology and aggregated status
//! - LVMVolumeGroup: Per device class projection consumed by node agents
//! - LVMVolumeGroupNodeStatus: Per node report written by node agents

pub mod lvm_cluster;
pub mod lvm_volume_group;
pub mod node_status;

pub use lvm_cluster::*;
pub use lvm_volume_group::*;
pub use node_status::*;

use kube::CustomResourceExt;

/// Finalizer the operator keeps on the LVMCluster
pub const CLUSTER_FINALIZER: &str = "lvmcluster.topolvm.io";

/// Finalizer the operator keeps on every LVMVolumeGroup
pub const VOLUME_GROUP_FINALIZER: &str = "lvmvolumegroup.topolvm.io";

/// Render every CRD owned by the operator as a multi-document YAML stream
pub fn crds_yaml() -> Result<String, serde_yaml::Error> {
    let docs = [
        serde_yaml::to_string(&LVMCluster::crd())?,
        serde_yaml::to_string(&LVMVolumeGroup::crd())?,
        serde_yaml::to_string(&LVMVolumeGroupNodeStatus::crd())?,
    ];
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_metadata() {
        let crd = LVMCluster::crd();
        assert_eq!(crd.spec.group, "lvm.topolvm.io");
        assert_eq!(crd.spec.names.kind, "LVMCluster");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.short_names, Some(vec!["lvms".to_string()]));
    }

    #[test]
    fn test_crds_yaml_contains_all_kinds() {
        let yaml = crds_yaml().unwrap();
        assert!(yaml.contains("kind: LVMCluster"));
        assert!(yaml.contains("kind: LVMVolumeGroup\n"));
        assert!(yaml.contains("kind: LVMVolumeGroupNodeStatus"));
        assert_eq!(yaml.matches("---\n").count(), 2);
    }
}
