//! TLS listener for the admission webhook

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::webhook::{webhook_router, WebhookState};
use crate::Error;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate chain PEM file
    pub cert_path: PathBuf,
    /// TLS private key PEM file
    pub key_path: PathBuf,
}

/// Serve the webhook router over HTTPS until the listener fails
pub async fn start_server(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), Error> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| {
            Error::config(format!(
                "TLS config error ({}, {}): {}",
                config.cert_path.display(),
                config.key_path.display(),
                e
            ))
        })?;

    let app = webhook_router(state);

    info!(addr = %config.addr, "Starting admission webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::server(format!("Server error: {}", e)))?;

    Ok(())
}
