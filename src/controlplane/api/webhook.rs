//! LVMCluster Validating Webhook
//!
//! Decodes AdmissionReview requests for LVMCluster objects and answers them
//! with the outcome of the admission validator.

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::admission::{validate_create, validate_update, ValidationError};
use crate::crd::LVMCluster;
use crate::domain::{ClusterLister, ClusterListerRef};
use crate::error::Result;

/// Path the ValidatingWebhookConfiguration points at
pub const VALIDATE_PATH: &str = "/validate-lvm-topolvm-io-v1alpha1-lvmcluster";

// =============================================================================
// Cluster Lister
// =============================================================================

/// Lists stored LVMClusters through the Kubernetes API
pub struct KubeClusterLister {
    client: Client,
}

impl KubeClusterLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLister for KubeClusterLister {
    async fn list_clusters(&self) -> Result<Vec<LVMCluster>> {
        let api: Api<LVMCluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    pub lister: ClusterListerRef,
    /// The only namespace an LVMCluster may be created in
    pub operator_namespace: String,
}

impl WebhookState {
    pub fn new(lister: ClusterListerRef, operator_namespace: impl Into<String>) -> Self {
        Self {
            lister,
            operator_namespace: operator_namespace.into(),
        }
    }
}

/// Create the webhook router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(validate_handler))
        .with_state(state)
}

/// Handle a validating admission review for LVMCluster
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = review(&state, &req).await;
    Json(response.into_review())
}

fn decode(obj: Option<&DynamicObject>, what: &str) -> std::result::Result<LVMCluster, String> {
    let obj = obj.ok_or_else(|| format!("admission request carries no {}", what))?;
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| format!("failed to decode {} as LVMCluster: {}", what, e))
}

fn reject(req: &AdmissionRequest<DynamicObject>, err: &ValidationError) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(req).deny(err.to_string());
    response.result.code = err.code();
    response.result.reason = err.reason().to_string();
    response
}

/// Decide one admission request
pub async fn review(state: &WebhookState, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let outcome = match req.operation {
        Operation::Create => {
            let cluster = match decode(req.object.as_ref(), "object") {
                Ok(c) => c,
                Err(msg) => return AdmissionResponse::from(req).deny(msg),
            };
            let existing = match state.lister.list_clusters().await {
                Ok(list) => list,
                Err(e) => {
                    error!(error = %e, "Failed to list LVMClusters");
                    return AdmissionResponse::from(req).deny(e.to_string());
                }
            };
            info!("Validating creation of LVMCluster {}", cluster.name_any());
            validate_create(&cluster, &existing, &state.operator_namespace)
        }
        Operation::Update => {
            let (old, new) = match (
                decode(req.old_object.as_ref(), "oldObject"),
                decode(req.object.as_ref(), "object"),
            ) {
                (Ok(old), Ok(new)) => (old, new),
                (Err(msg), _) | (_, Err(msg)) => return AdmissionResponse::from(req).deny(msg),
            };
            info!("Validating update of LVMCluster {}", new.name_any());
            validate_update(&old, &new)
        }
        _ => {
            debug!(uid = %req.uid, "Operation needs no validation");
            Ok(())
        }
    };

    match outcome {
        Ok(()) => AdmissionResponse::from(req),
        Err(e) => {
            warn!(uid = %req.uid, "Rejected LVMCluster: {}", e);
            reject(req, &e)
        }
    }
}
