//! Domain Ports - Core trait definitions for the LVMS operator
//!
//! These traits define the boundaries between the reconcile/admission logic
//! and the Kubernetes API. Production adapters talk to the API server; tests
//! plug in in-memory implementations.

use crate::crd::LVMCluster;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Cluster Type
// =============================================================================

/// Flavor of the Kubernetes distribution the operator runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterType {
    OpenShift,
    Kubernetes,
}

impl ClusterType {
    /// Whether OpenShift-only resources (security context constraints) apply
    pub fn is_openshift(&self) -> bool {
        matches!(self, ClusterType::OpenShift)
    }
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterType::OpenShift => write!(f, "openshift"),
            ClusterType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

// =============================================================================
// Cluster Type Probe Port
// =============================================================================

/// Port for detecting the distribution flavor
#[async_trait]
pub trait ClusterTypeProbe: Send + Sync {
    /// Inspect the API server and report the distribution flavor
    async fn probe(&self) -> Result<ClusterType>;
}

// =============================================================================
// Cluster Lister Port
// =============================================================================

/// Port for listing the LVMCluster objects that already exist
#[async_trait]
pub trait ClusterLister: Send + Sync {
    /// List LVMCluster objects across all namespaces
    async fn list_clusters(&self) -> Result<Vec<LVMCluster>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterTypeProbeRef = Arc<dyn ClusterTypeProbe>;
pub type ClusterListerRef = Arc<dyn ClusterLister>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_type_display() {
        assert_eq!(format!("{}", ClusterType::OpenShift), "openshift");
        assert_eq!(format!("{}", ClusterType::Kubernetes), "kubernetes");
        assert!(ClusterType::OpenShift.is_openshift());
        assert!(!ClusterType::Kubernetes.is_openshift());
    }
}
