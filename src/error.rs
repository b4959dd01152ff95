//! Error types for the LVMS Operator
//!
//! Provides the unified error type for the reconcile loop, the resource
//! units and the API servers, together with the requeue policy each error
//! class maps to.

use std::time::Duration;
use thiserror::Error;

/// Delay before re-checking state owned by an external actor
/// (outstanding logical volumes, volume group retraction).
pub const EXTERNAL_WAIT_REQUEUE: Duration = Duration::from_secs(10);

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource {kind}/{name} is missing required field {field}")]
    MissingField {
        kind: String,
        name: String,
        field: String,
    },

    // =========================================================================
    // Reconcile Pass Errors
    // =========================================================================
    #[error("Found {count} LVMCluster objects, only one is allowed")]
    MultipleClusters { count: usize },

    #[error("Unable to resolve operator image: {0}")]
    OwnImage(String),

    #[error("Resource unit {unit} failed: {source}")]
    UnitFailed {
        unit: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{} resource unit(s) failed: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<Error>),

    // =========================================================================
    // Waiting On External State
    // =========================================================================
    #[error("{count} logical volume(s) still provisioned from this LVMCluster, waiting for their removal")]
    VolumesPending { count: usize },

    #[error("Waiting for the node agents to retract volume groups: {}", .names.join(", "))]
    VolumeGroupsPending { names: Vec<String> },

    // =========================================================================
    // Serving Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap an error as the failure of a named resource unit
    pub fn unit(unit: impl Into<String>, source: Error) -> Self {
        Error::UnitFailed {
            unit: unit.into(),
            source: Box::new(source),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Waiting for an external actor - fixed delay, not faster retries
            Error::VolumesPending { .. } | Error::VolumeGroupsPending { .. } => {
                ErrorAction::RequeueAfter(EXTERNAL_WAIT_REQUEUE)
            }

            Error::UnitFailed { source, .. } => source.action(),

            // Only a pure wait keeps its fixed delay; anything else backs off
            Error::Aggregate(errors) => {
                let mut shortest: Option<Duration> = None;
                for err in errors {
                    match err.action() {
                        ErrorAction::RequeueAfter(d) => {
                            shortest = Some(shortest.map_or(d, |s| s.min(d)));
                        }
                        _ => return ErrorAction::RequeueWithBackoff,
                    }
                }
                shortest.map_or(ErrorAction::RequeueWithBackoff, ErrorAction::RequeueAfter)
            }

            Error::Configuration(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error only reflects waiting on an external actor
    pub fn is_waiting(&self) -> bool {
        matches!(self.action(), ErrorAction::RequeueAfter(_))
    }

    /// Check if this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(e) => is_kube_not_found(e),
            _ => false,
        }
    }
}

/// Check whether a kube error is an API 404
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
