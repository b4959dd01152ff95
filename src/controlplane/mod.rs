//! Control Plane Module
//!
//! Turns the LVMCluster desired state into the running TopoLVM stack and
//! reports the volume group health back into the cluster status.

pub mod api;
pub mod cluster_type;
pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod scheduling;
pub mod status;
pub mod units;

pub use cluster_type::{ClusterTypeResolver, SccProbe};
pub use metrics::OperatorMetrics;
pub use orchestrator::{ImageConfig, Orchestrator, OrchestratorConfig};
pub use reconciler::run_controller;
