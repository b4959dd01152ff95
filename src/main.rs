//! LVMS Operator
//!
//! Runs the LVMCluster controller together with its probe, metrics and
//! admission webhook servers.

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lvms_operator::controlplane::api::{
    health_router, metrics_router, serve_http, serve_webhook, webhook_router, KubeClusterLister,
    ServerConfig, WebhookState,
};
use lvms_operator::controlplane::run_controller;
use lvms_operator::{
    ClusterTypeResolver, ImageConfig, OperatorMetrics, Orchestrator, OrchestratorConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LVMS Operator - LVM local storage for Kubernetes via TopoLVM
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace the operator, its workloads and the LVMCluster live in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "openshift-storage")]
    namespace: String,

    /// Name of the operator pod, used to discover the operator image
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Operator image to deploy, skips the pod lookup
    #[arg(long, env = "OPERATOR_IMAGE")]
    operator_image: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Admission webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// PEM certificate for the admission webhook
    #[arg(long, env = "WEBHOOK_CERT_FILE")]
    webhook_cert_file: Option<PathBuf>,

    /// PEM private key for the admission webhook
    #[arg(long, env = "WEBHOOK_KEY_FILE")]
    webhook_key_file: Option<PathBuf>,

    /// Do not serve the admission webhook
    #[arg(long, env = "DISABLE_WEBHOOK")]
    disable_webhook: bool,

    /// Requeue interval after a successful reconcile, in seconds
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "60")]
    resync_interval_secs: u64,

    /// csi-provisioner sidecar image
    #[arg(long, env = "CSI_PROVISIONER_IMAGE")]
    csi_provisioner_image: Option<String>,

    /// csi-resizer sidecar image
    #[arg(long, env = "CSI_RESIZER_IMAGE")]
    csi_resizer_image: Option<String>,

    /// csi-snapshotter sidecar image
    #[arg(long, env = "CSI_SNAPSHOTTER_IMAGE")]
    csi_snapshotter_image: Option<String>,

    /// csi-node-driver-registrar sidecar image
    #[arg(long, env = "CSI_REGISTRAR_IMAGE")]
    csi_registrar_image: Option<String>,

    /// livenessprobe sidecar image
    #[arg(long, env = "CSI_LIVENESSPROBE_IMAGE")]
    csi_liveness_probe_image: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CRD manifests and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn images(&self) -> ImageConfig {
        let defaults = ImageConfig::default();
        let pick = |value: &Option<String>, default: String| value.clone().unwrap_or(default);
        ImageConfig {
            csi_provisioner: pick(&self.csi_provisioner_image, defaults.csi_provisioner),
            csi_resizer: pick(&self.csi_resizer_image, defaults.csi_resizer),
            csi_snapshotter: pick(&self.csi_snapshotter_image, defaults.csi_snapshotter),
            csi_registrar: pick(&self.csi_registrar_image, defaults.csi_registrar),
            csi_liveness_probe: pick(&self.csi_liveness_probe_image, defaults.csi_liveness_probe),
        }
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            operator_image: self.operator_image.clone(),
            images: self.images(),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            health_addr: self.health_addr,
            metrics_addr: self.metrics_addr,
            webhook_addr: self.webhook_addr,
            webhook_cert_file: self.webhook_cert_file.clone(),
            webhook_key_file: self.webhook_key_file.clone(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", lvms_operator::crd::crds_yaml()?);
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting LVMS Operator");
    info!("  Version: {}", lvms_operator::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Webhook: {}", if args.disable_webhook { "disabled" } else { "enabled" });

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let metrics = Arc::new(OperatorMetrics::new().context("failed to register metrics")?);
    let resolver = Arc::new(ClusterTypeResolver::new(client.clone()));
    let orchestrator = Orchestrator::new(
        client.clone(),
        args.orchestrator_config(),
        resolver,
        metrics.clone(),
    );

    let servers = args.server_config();

    // Start health server
    let health_addr = servers.health_addr;
    tokio::spawn(async move {
        if let Err(e) = serve_http("Health", health_addr, health_router()).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = servers.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = serve_http("Metrics", metrics_addr, metrics_router(metrics)).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Start admission webhook
    if args.disable_webhook {
        info!("Admission webhook disabled");
    } else if let Some((cert, key)) = servers.webhook_tls() {
        let state = Arc::new(WebhookState::new(
            Arc::new(KubeClusterLister::new(client.clone())),
            args.namespace.clone(),
        ));
        let addr = servers.webhook_addr;
        tokio::spawn(async move {
            if let Err(e) = serve_webhook(addr, webhook_router(state), cert, key).await {
                error!("Admission webhook error: {}", e);
            }
        });
    } else {
        warn!("WEBHOOK_CERT_FILE and WEBHOOK_KEY_FILE not set, admission webhook not served");
    }

    run_controller(client, orchestrator).await;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["lvms-operator"]);
        let config = args.orchestrator_config();
        assert_eq!(config.namespace, "openshift-storage");
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(args.server_config().webhook_addr.port(), 9443);
    }

    #[test]
    fn test_image_overrides() {
        let args = Args::parse_from([
            "lvms-operator",
            "--csi-resizer-image",
            "mirror.local/csi-resizer:v1",
        ]);
        let images = args.images();
        assert_eq!(images.csi_resizer, "mirror.local/csi-resizer:v1");
        assert_eq!(images.csi_provisioner, ImageConfig::default().csi_provisioner);
    }
}
