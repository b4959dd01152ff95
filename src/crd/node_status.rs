//! LVMVolumeGroupNodeStatus CRD
//!
//! Written by the per-node agent, one object per node named after the node.
//! The operator only reads these to aggregate cluster readiness.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-node volume group report
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lvm.topolvm.io",
    version = "v1alpha1",
    kind = "LVMVolumeGroupNodeStatus",
    plural = "lvmvolumegroupnodestatuses",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LVMVolumeGroupNodeStatusSpec {
    /// Status of every volume group on the node
    #[serde(default)]
    pub node_status: Vec<VGStatus>,
}

/// Status of one volume group on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VGStatus {
    /// Volume group (device class) name
    pub name: String,

    /// Volume group state
    pub status: VGStatusType,

    /// Reason for the state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Devices in the volume group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,

    /// Devices that were considered and rejected
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedDevice>,

    /// Policy the agent used to discover devices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_discovery_policy: Option<DeviceDiscoveryPolicy>,
}

/// Volume group state reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VGStatusType {
    Progressing,
    Ready,
    Failed,
    Degraded,
}

impl std::fmt::Display for VGStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VGStatusType::Progressing => write!(f, "Progressing"),
            VGStatusType::Ready => write!(f, "Ready"),
            VGStatusType::Failed => write!(f, "Failed"),
            VGStatusType::Degraded => write!(f, "Degraded"),
        }
    }
}

/// A device the agent refused, with its reasons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedDevice {
    /// Device path
    pub name: String,

    /// Why the device was excluded
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Device discovery mode of the node agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceDiscoveryPolicy {
    #[default]
    RuntimeDynamic,
    Static,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_report() {
        let report: LVMVolumeGroupNodeStatusSpec = serde_json::from_value(serde_json::json!({
            "nodeStatus": [
                {"name": "vg1", "status": "Ready", "devices": ["/dev/sdb"]},
                {
                    "name": "vg2",
                    "status": "Failed",
                    "reason": "no available devices",
                    "excluded": [{"name": "/dev/sdc", "reasons": ["has partitions"]}]
                }
            ]
        }))
        .unwrap();

        assert_eq!(report.node_status.len(), 2);
        assert_eq!(report.node_status[0].status, VGStatusType::Ready);
        assert_eq!(report.node_status[1].excluded[0].reasons, vec!["has partitions"]);
        assert!(report.node_status[0].device_discovery_policy.is_none());
    }
}
