//! Admission decisions and the per-request denial taxonomy

use std::fmt;

use json_patch::{Patch, PatchOperation};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::Resource;
use thiserror::Error;
use tracing::error;

/// Where a required configuration key is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// `metadata.labels` of the admitted object
    Label,
    /// `metadata.annotations` of the admitted object
    Annotation,
    /// `spec.template.metadata.annotations` of a workload
    TemplateAnnotation,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Label => write!(f, "label"),
            Source::Annotation => write!(f, "annotation"),
            Source::TemplateAnnotation => write!(f, "spec.template annotation"),
        }
    }
}

/// Reasons an admission call is denied.
///
/// The `Display` text is returned to the API server as the denial message, so
/// every variant names the key or value the user has to fix.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The admitted object could not be decoded into its expected type
    #[error("cannot decode {kind}: {message}")]
    Decode {
        /// Resource kind being decoded
        kind: String,
        /// Decoder error text
        message: String,
    },

    /// A key required by an enabled capability is absent
    #[error("required {origin} '{key}' is not set")]
    Missing {
        /// Where the key was expected
        origin: Source,
        /// The missing key
        key: &'static str,
    },

    /// A key required by an enabled capability is present but empty
    #[error("required {origin} '{key}' must not be empty")]
    Empty {
        /// Where the key was read
        origin: Source,
        /// The empty key
        key: &'static str,
    },

    /// A token failed its grammar
    #[error("{origin} '{key}' value '{token}' format error. Example: {example}")]
    Format {
        /// Where the key was read
        origin: Source,
        /// The key carrying the bad token
        key: &'static str,
        /// The offending token
        token: String,
        /// A well-formed value for the key
        example: &'static str,
    },

    /// A list contains repeated tokens
    #[error("{origin} '{key}' contains duplicates {values:?}. Example: {example}")]
    Duplicate {
        /// Where the key was read
        origin: Source,
        /// The key carrying the list
        key: &'static str,
        /// The full token list
        values: Vec<String>,
        /// A well-formed value for the key
        example: &'static str,
    },

    /// Cross-field policy violation
    #[error("{0}")]
    Semantic(String),

    /// Auxiliary resource provisioning failed
    #[error("{0}")]
    ExternalResource(String),

    /// A patch value could not be encoded
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Create a semantic error with the given message
    pub fn semantic(msg: impl Into<String>) -> Self {
        Self::Semantic(msg.into())
    }

    /// Create an external resource error with the given message
    pub fn external_resource(msg: impl Into<String>) -> Self {
        Self::ExternalResource(msg.into())
    }
}

/// Serialize a patch value, mapping failure to a denial
pub fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, AdmissionError> {
    serde_json::to_value(value).map_err(|e| AdmissionError::Internal(e.to_string()))
}

/// Outcome of evaluating one admission request
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Ordered JSON Patch, empty when nothing changes
    pub patch: Vec<PatchOperation>,
    /// Denial reason, set when `allowed` is false
    pub reason: Option<String>,
}

impl Decision {
    /// Admit unchanged
    pub fn allow() -> Self {
        Self {
            allowed: true,
            patch: Vec::new(),
            reason: None,
        }
    }

    /// Admit with the given patch
    pub fn patch(ops: Vec<PatchOperation>) -> Self {
        Self {
            allowed: true,
            patch: ops,
            reason: None,
        }
    }

    /// Reject with a reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            patch: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    /// Build the response for `request`, echoing its uid
    pub fn into_response<T: Resource>(self, request: &AdmissionRequest<T>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);

        if !self.allowed {
            return response.deny(self.reason.unwrap_or_default());
        }
        if self.patch.is_empty() {
            return response;
        }

        match response.with_patch(Patch(self.patch)) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
            }
        }
    }
}

impl From<AdmissionError> for Decision {
    fn from(err: AdmissionError) -> Self {
        Self::deny(err.to_string())
    }
}

impl From<Result<Vec<PatchOperation>, AdmissionError>> for Decision {
    fn from(result: Result<Vec<PatchOperation>, AdmissionError>) -> Self {
        match result {
            Ok(ops) => Self::patch(ops),
            Err(e) => e.into(),
        }
    }
}

impl From<Result<(), AdmissionError>> for Decision {
    fn from(result: Result<(), AdmissionError>) -> Self {
        match result {
            Ok(()) => Self::allow(),
            Err(e) => e.into(),
        }
    }
}
