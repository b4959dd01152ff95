//! LVMVolumeGroup CRD
//!
//! Projection of one device class, consumed by the per-node agent. Owned by
//! the LVMCluster and protected by a finalizer the operator removes only
//! after every agent has retracted the volume group.

use k8s_openapi::api::core::v1::NodeSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::lvm_cluster::{DeviceSelector, ThinPoolConfig};
use super::node_status::DeviceDiscoveryPolicy;

/// Desired volume group, mirrored from a device class
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lvm.topolvm.io",
    version = "v1alpha1",
    kind = "LVMVolumeGroup",
    plural = "lvmvolumegroups",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LVMVolumeGroupSpec {
    /// Devices to include
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<DeviceSelector>,

    /// Nodes the volume group is created on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,

    /// Thin pool configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_pool_config: Option<ThinPoolConfig>,

    /// Whether this is the default volume group
    #[serde(default)]
    pub default: bool,

    /// Device discovery mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_discovery_policy: Option<DeviceDiscoveryPolicy>,
}
