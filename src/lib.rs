//! LVMS Operator - Local Storage Control Plane
//!
//! A Kubernetes operator that turns a declarative LVM storage topology (the
//! `LVMCluster` resource and its device classes) into a running TopoLVM CSI
//! stack, and reports per-node volume group health back into the cluster
//! status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        LVMCluster Controller                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────────────┐  │
//! │  │  Admission     │  │   Orchestrator   │  │   Status Aggregator  │  │
//! │  │  Webhook       │  │  (unit fan-out)  │  │  (node reports)      │  │
//! │  └────────────────┘  └────────┬─────────┘  └──────────────────────┘  │
//! │                               │                                      │
//! ├───────────────────────────────┴──────────────────────────────────────┤
//! │                          Resource Units                              │
//! │  CSIDriver · topolvm-controller · topolvm-node · vg-manager          │
//! │  LVMVolumeGroups · StorageClasses · VolumeSnapshotClasses · SCCs     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`admission`]: Stateless LVMCluster validation
//! - [`controlplane`]: Reconciler, resource units, status and HTTP surfaces
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and ports
//! - [`error`]: Error types and handling

pub mod admission;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use admission::{validate_create, validate_update, ValidationError};

pub use controlplane::{
    ClusterTypeResolver, ImageConfig, OperatorMetrics, Orchestrator, OrchestratorConfig,
};

pub use crd::{
    DeviceClass, LVMCluster, LVMClusterSpec, LVMClusterStatus, LVMVolumeGroup,
    LVMVolumeGroupNodeStatus, VGStatusType,
};

pub use domain::ports::{ClusterLister, ClusterType, ClusterTypeProbe};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
