//! Cluster type resolution
//!
//! Detects whether the operator runs on OpenShift by looking for the
//! built-in `privileged` SecurityContextConstraints object. The answer is
//! computed once and kept for the lifetime of the process; a cluster that
//! changes flavor needs an operator restart.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::Client;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::domain::{ClusterType, ClusterTypeProbe, ClusterTypeProbeRef};
use crate::error::{is_kube_not_found, Result};

/// SecurityContextConstraints object every OpenShift cluster ships
pub const PRIVILEGED_SCC: &str = "privileged";

/// ApiResource for OpenShift SecurityContextConstraints
pub fn scc_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("security.openshift.io", "v1", "SecurityContextConstraints"),
        "securitycontextconstraints",
    )
}

// =============================================================================
// Probe
// =============================================================================

/// Probe backed by the Kubernetes API
pub struct SccProbe {
    client: Client,
}

impl SccProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterTypeProbe for SccProbe {
    async fn probe(&self) -> Result<ClusterType> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &scc_api_resource());
        match api.get_opt(PRIVILEGED_SCC).await {
            Ok(Some(_)) => Ok(ClusterType::OpenShift),
            Ok(None) => Ok(ClusterType::Kubernetes),
            // The SCC API itself is absent on plain Kubernetes
            Err(e) if is_kube_not_found(&e) => Ok(ClusterType::Kubernetes),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Memoized cluster type lookup
///
/// Constructed once and shared by every reconcile pass. A failed probe is not
/// cached, so the next pass retries it.
pub struct ClusterTypeResolver {
    probe: ClusterTypeProbeRef,
    cached: OnceCell<ClusterType>,
}

impl ClusterTypeResolver {
    /// Create a resolver that asks the API server
    pub fn new(client: Client) -> Self {
        Self::with_probe(Arc::new(SccProbe::new(client)))
    }

    /// Create a resolver with an explicit probe
    pub fn with_probe(probe: ClusterTypeProbeRef) -> Self {
        Self {
            probe,
            cached: OnceCell::new(),
        }
    }

    /// Resolve the cluster type, probing on first use only
    pub async fn resolve(&self) -> Result<ClusterType> {
        let cluster_type = self
            .cached
            .get_or_try_init(|| async {
                let detected = self.probe.probe().await?;
                info!("Detected cluster type: {}", detected);
                Ok::<_, crate::error::Error>(detected)
            })
            .await?;
        Ok(*cluster_type)
    }

    /// Cached answer, if a probe already succeeded
    pub fn cached(&self) -> Option<ClusterType> {
        self.cached.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ClusterTypeProbe for CountingProbe {
        async fn probe(&self) -> Result<ClusterType> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(Error::Internal("apiserver unavailable".into()));
            }
            Ok(ClusterType::OpenShift)
        }
    }

    #[tokio::test]
    async fn test_probe_runs_once() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let resolver = ClusterTypeResolver::with_probe(probe.clone());

        assert_eq!(resolver.resolve().await.unwrap(), ClusterType::OpenShift);
        assert_eq!(resolver.resolve().await.unwrap(), ClusterType::OpenShift);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_is_retried() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let resolver = ClusterTypeResolver::with_probe(probe.clone());

        assert!(resolver.resolve().await.is_err());
        assert!(resolver.cached().is_none());
        assert_eq!(resolver.resolve().await.unwrap(), ClusterType::OpenShift);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}
