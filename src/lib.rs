//! Preset admission - Kubernetes admission webhook for workload presets
//!
//! The API server calls this webhook synchronously when selected resources
//! are created, updated or deleted. Each capability is driven by labels and
//! annotations on the admitted object and answers with an allow/deny decision
//! and, for mutating routes, a JSON Patch.
//!
//! # Capabilities
//!
//! - Fixed pod IP: StatefulSet replicas pinned to a node and Calico IPs per
//!   ordinal (`fix.pod.ip`)
//! - Endpoint extension: external addresses appended to, or backup addresses
//!   withheld from, an Endpoints object (`endpoint-extend`)
//! - Log sidecar: a log/metrics sidecar injected into pods, with a
//!   per-workload script ConfigMap (`log-injection`)
//!
//! # Modules
//!
//! - [`webhook`] - HTTP routes, dispatch and admission decisions
//! - [`capability`] - Per-capability evaluators
//! - [`validate`] - IPv4, port and list validators
//! - [`patch`] - JSON Patch construction
//! - [`gateway`] - ConfigMap store used by the log sidecar
//! - [`retry`] - Bounded retry for gateway calls
//! - [`server`] - TLS listener
//! - [`config`] - Engine settings
//! - [`error`] - Error types for the process

#![deny(missing_docs)]

pub mod capability;
pub mod config;
pub mod error;
pub mod gateway;
pub mod patch;
pub mod retry;
pub mod server;
pub mod validate;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port the injected sidecar serves metrics on
pub const DEFAULT_METRICS_PORT: u16 = 9100;

/// Default image of the injected log/metrics sidecar
pub const DEFAULT_SIDECAR_IMAGE: &str = "log-metrics-sidecar:latest";

/// Default TLS certificate path, matching the usual webhook Secret mount
pub const DEFAULT_TLS_CERT_PATH: &str = "/etc/webhook/certs/cert.pem";

/// Default TLS private key path
pub const DEFAULT_TLS_KEY_PATH: &str = "/etc/webhook/certs/key.pem";
