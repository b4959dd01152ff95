//! Operator HTTP Servers
//!
//! Plain HTTP listeners for probes and Prometheus scraping, and the TLS
//! listener for the admission webhook.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::controlplane::metrics::OperatorMetrics;
use crate::error::{Error, Result};

// =============================================================================
// Server Configuration
// =============================================================================

/// Listen addresses and webhook TLS material
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub health_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub webhook_addr: SocketAddr,
    /// PEM certificate served by the webhook
    pub webhook_cert_file: Option<PathBuf>,
    /// PEM private key of the webhook certificate
    pub webhook_key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            webhook_addr: SocketAddr::from(([0, 0, 0, 0], 9443)),
            webhook_cert_file: None,
            webhook_key_file: None,
        }
    }
}

impl ServerConfig {
    /// Certificate and key, when both are configured
    pub fn webhook_tls(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.webhook_cert_file, &self.webhook_key_file) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

// =============================================================================
// Routers
// =============================================================================

async fn ok() -> &'static str {
    "ok"
}

/// Liveness and readiness probes
pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(ok))
        .route("/livez", get(ok))
        .route("/readyz", get(ok))
}

async fn metrics_handler(State(metrics): State<Arc<OperatorMetrics>>) -> Response {
    match metrics.render() {
        Ok((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Prometheus scrape endpoint
pub fn metrics_router(metrics: Arc<OperatorMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

// =============================================================================
// Listeners
// =============================================================================

/// Serve `router` over plain HTTP until ctrl-c
pub async fn serve_http(name: &str, addr: SocketAddr, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server on {}: {}", name, addr, e)))?;

    info!("{} server listening on {}", name, addr);

    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| Error::Internal(format!("{} server error: {}", name, e)))?;

    info!("{} server stopped", name);
    Ok(())
}

/// Serve the admission webhook over TLS
pub async fn serve_webhook(
    addr: SocketAddr,
    router: Router,
    cert: PathBuf,
    key: PathBuf,
) -> Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| Error::Configuration(format!("webhook TLS config error: {}", e)))?;

    info!("Admission webhook listening on {}", addr);

    axum_server::bind_rustls(addr, tls_config)
        .serve(router.layer(TraceLayer::new_for_http()).into_make_service())
        .await
        .map_err(|e| Error::Internal(format!("webhook server error: {}", e)))?;

    Ok(())
}
