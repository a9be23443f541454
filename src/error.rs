//! Error types for the admission webhook process

use thiserror::Error;

/// Main error type for process-level operations
///
/// Per-request admission failures are not represented here; those become
/// denials through [`crate::webhook::AdmissionError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid startup configuration (TLS material, CLI values)
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP server failure
    #[error("server error: {0}")]
    Server(String),

    /// Auxiliary resource (ConfigMap) operation failed
    #[error("external resource error: {0}")]
    ExternalResource(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Create an external resource error with the given message
    pub fn external_resource(msg: impl Into<String>) -> Self {
        Self::ExternalResource(msg.into())
    }
}
