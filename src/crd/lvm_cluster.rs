//! LVMCluster CRD
//!
//! The single top-level desired-state object. Lists the device classes the
//! operator projects onto nodes and carries the aggregated readiness
//! reported back by the per-node agents.

use k8s_openapi::api::core::v1::{NodeSelector, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::node_status::{DeviceDiscoveryPolicy, ExcludedDevice, VGStatusType};

/// Filesystem type used when a device class does not name one
pub const DEFAULT_FILESYSTEM: &str = "xfs";

/// Thin pool size used when a thin pool config does not name one
pub const DEFAULT_THIN_POOL_SIZE_PERCENT: i32 = 90;

// =============================================================================
// LVMCluster CRD
// =============================================================================

/// LVMCluster describes the local-disk storage topology of the cluster:
/// which devices form which volume groups on which nodes, and how the
/// resulting thin pools are provisioned.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lvm.topolvm.io",
    version = "v1alpha1",
    kind = "LVMCluster",
    plural = "lvmclusters",
    shortname = "lvms",
    status = "LVMClusterStatus",
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LVMClusterSpec {
    /// Tolerations applied to the per-node daemons
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Storage topology
    pub storage: Storage,
}

/// Storage topology of the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Device classes, names unique within the list
    #[serde(default)]
    pub device_classes: Vec<DeviceClass>,
}

// =============================================================================
// Device Classes
// =============================================================================

/// A named policy grouping local block devices into one volume group per
/// matching node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClass {
    /// Name of the device class, also the name of the volume group
    #[schemars(regex(pattern = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"), length(max = 63))]
    pub name: String,

    /// Devices to include; all available devices when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<DeviceSelector>,

    /// Nodes on which the volume group is created; all nodes when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,

    /// Thin pool configuration; thick provisioning when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_pool_config: Option<ThinPoolConfig>,

    /// Marks the default device class
    #[serde(default)]
    pub default: bool,

    /// Filesystem of volumes provisioned from this class (ext4 or xfs)
    #[serde(default = "default_filesystem")]
    pub fstype: String,

    /// How the node agent discovers devices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_discovery_policy: Option<DeviceDiscoveryPolicy>,

    /// Extra options for the generated StorageClass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_options: Option<StorageClassOptions>,
}

/// Device path selection for a device class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    /// Devices that must be present and usable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// Devices used when present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_paths: Vec<String>,

    /// Wipe the selected devices before use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_wipe_devices_and_destroy_all_data: Option<bool>,
}

impl DeviceSelector {
    /// Required and optional paths, in declaration order
    pub fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.paths.iter().chain(self.optional_paths.iter())
    }

    /// Whether no path of either kind is listed
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.optional_paths.is_empty()
    }
}

/// Thin pool provisioning policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThinPoolConfig {
    /// Name of the thin pool logical volume
    pub name: String,

    /// Share of the volume group given to the thin pool
    #[serde(default = "default_size_percent")]
    #[schemars(range(min = 10, max = 100))]
    pub size_percent: i32,

    /// Factor by which the pool may be overcommitted
    #[schemars(range(min = 1, max = 100))]
    pub overprovision_ratio: i32,

    /// How the chunk size is determined
    #[serde(default)]
    pub chunk_size_calculation_policy: ChunkSizeCalculationPolicy,

    /// Chunk size when the policy is Static
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<Quantity>,

    /// How the metadata size is determined
    #[serde(default)]
    pub metadata_size_calculation_policy: MetadataSizeCalculationPolicy,

    /// Metadata size when the policy is Static
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<Quantity>,
}

/// Chunk size calculation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ChunkSizeCalculationPolicy {
    #[default]
    Static,
    Host,
}

/// Metadata size calculation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MetadataSizeCalculationPolicy {
    #[default]
    Host,
    Static,
}

/// Options copied into the generated StorageClass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassOptions {
    /// Reclaim policy, Delete when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<String>,

    /// Binding mode, WaitForFirstConsumer when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_binding_mode: Option<String>,

    /// Extra provisioner parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_parameters: BTreeMap<String, String>,

    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the LVMCluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LVMClusterStatus {
    /// Mirrors `state == Ready`
    #[serde(default)]
    pub ready: bool,

    /// Aggregated state
    #[serde(default)]
    pub state: LVMClusterState,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Per device class, per node volume group status
    ///
    /// Always serialized: status is written with a merge patch, where an
    /// absent key would leave the stored list in place.
    #[serde(default)]
    pub device_class_statuses: Vec<DeviceClassStatus>,
}

/// Aggregated cluster state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LVMClusterState {
    Progressing,
    Ready,
    Failed,
    Degraded,
    #[default]
    Unknown,
}

impl std::fmt::Display for LVMClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LVMClusterState::Progressing => write!(f, "Progressing"),
            LVMClusterState::Ready => write!(f, "Ready"),
            LVMClusterState::Failed => write!(f, "Failed"),
            LVMClusterState::Degraded => write!(f, "Degraded"),
            LVMClusterState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Volume group status of one device class across nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClassStatus {
    /// Device class (volume group) name
    pub name: String,

    /// Status reported by each node
    #[serde(default)]
    pub node_status: Vec<NodeStatus>,
}

/// Volume group status on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node name
    pub node: String,

    /// Volume group status on the node
    pub status: VGStatusType,

    /// Reason for the status
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Devices in the volume group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,

    /// Devices the agent refused to use
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedDevice>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_filesystem() -> String {
    DEFAULT_FILESYSTEM.to_string()
}

fn default_size_percent() -> i32 {
    DEFAULT_THIN_POOL_SIZE_PERCENT
}

// =============================================================================
// Implementations
// =============================================================================

impl LVMCluster {
    /// Device classes in declaration order
    pub fn device_classes(&self) -> &[DeviceClass] {
        &self.spec.storage.device_classes
    }

    /// Look up a device class by name
    pub fn device_class(&self, name: &str) -> Option<&DeviceClass> {
        self.device_classes().iter().find(|dc| dc.name == name)
    }

    /// Whether the given device class acts as the default one
    ///
    /// A lone device class is the default regardless of its flag.
    pub fn is_default_device_class(&self, device_class: &DeviceClass) -> bool {
        self.device_classes().len() == 1 || device_class.default
    }

    /// Names of volume groups still reported in status
    pub fn reported_volume_groups(&self) -> Vec<&str> {
        self.status
            .as_ref()
            .map(|s| {
                s.device_class_statuses
                    .iter()
                    .map(|dcs| dcs.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DeviceClass {
    /// Whether volumes from this class are thin provisioned
    pub fn is_thin(&self) -> bool {
        self.thin_pool_config.is_some()
    }
}
