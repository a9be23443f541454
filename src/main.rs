//! Preset admission - Kubernetes admission webhook for workload presets

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use preset_admission::config::{EmptiedSubsetPolicy, EngineConfig};
use preset_admission::gateway::KubeConfigMapStore;
use preset_admission::retry::RetryConfig;
use preset_admission::server::{start_server, ServerConfig};
use preset_admission::webhook::WebhookState;
use preset_admission::{
    DEFAULT_METRICS_PORT, DEFAULT_SIDECAR_IMAGE, DEFAULT_TLS_CERT_PATH, DEFAULT_TLS_KEY_PATH,
};

/// Preset admission - fixed pod IPs, endpoint extension and log sidecar injection
#[derive(Parser, Debug)]
#[command(name = "preset-admission", version, about, long_about = None)]
struct Cli {
    /// Address the HTTPS listener binds to
    #[arg(long, env = "PRESET_ADDR", default_value = "0.0.0.0:8443")]
    addr: SocketAddr,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "PRESET_TLS_CERT", default_value = DEFAULT_TLS_CERT_PATH)]
    tls_cert: PathBuf,

    /// TLS private key (PEM)
    #[arg(long, env = "PRESET_TLS_KEY", default_value = DEFAULT_TLS_KEY_PATH)]
    tls_key: PathBuf,

    /// Image of the injected log/metrics sidecar
    #[arg(long, env = "PRESET_SIDECAR_IMAGE", default_value = DEFAULT_SIDECAR_IMAGE)]
    sidecar_image: String,

    /// Port the sidecar serves metrics on
    #[arg(long, env = "PRESET_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Handling of Endpoints subsets emptied by backup-IP filtering
    #[arg(long, env = "PRESET_EMPTIED_SUBSET_POLICY", value_enum, default_value_t = EmptiedSubsetPolicy::Leave)]
    emptied_subset_policy: EmptiedSubsetPolicy,

    /// Attempts per ConfigMap API call, including the first
    #[arg(long, env = "PRESET_GATEWAY_RETRIES", default_value_t = 3)]
    gateway_retries: u32,

    /// Emit logs as JSON
    #[arg(long, env = "PRESET_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The webhook cannot serve TLS without a working crypto provider.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = EngineConfig {
        sidecar_image: cli.sidecar_image,
        metrics_port: cli.metrics_port,
        emptied_subset_policy: cli.emptied_subset_policy,
    };
    tracing::info!(
        sidecar_image = %config.sidecar_image,
        metrics_port = config.metrics_port,
        emptied_subset_policy = %config.emptied_subset_policy,
        gateway_retries = cli.gateway_retries,
        "Engine configured"
    );

    let store = KubeConfigMapStore::new(client, RetryConfig::with_max_attempts(cli.gateway_retries));
    let state = Arc::new(WebhookState::new(config, Arc::new(store)));

    start_server(
        ServerConfig {
            addr: cli.addr,
            cert_path: cli.tls_cert,
            key_path: cli.tls_key,
        },
        state,
    )
    .await
    .map_err(|e| anyhow::anyhow!("{}", e))
}
