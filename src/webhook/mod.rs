//! Admission webhook HTTP layer
//!
//! One POST route per capability and mode:
//! - `/mutate/fixpodip`, `/validate/fixpodip`
//! - `/mutate/endpointextendip`, `/validate/endpointextendip`
//! - `/mutate/injectlogsidecar`, `/validate/injectlogsidecar`
//!
//! Every review is answered with HTTP 200. A body that cannot be decoded into
//! an `AdmissionReview` still gets a review back, with `allowed: false`, since
//! the API server treats transport errors according to the webhook's
//! `failurePolicy` rather than as a denial.

pub mod decision;
pub mod dispatch;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    core::TypeMeta,
};
use serde_json::Value;
use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::gateway::ConfigMapStore;

pub use decision::{to_value, AdmissionError, Decision, Source};
pub use dispatch::{Capability, Mode, ResourceKind};

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Settings read by the capability evaluators
    pub config: EngineConfig,
    /// Store for the log sidecar's script ConfigMaps
    pub configmaps: Arc<dyn ConfigMapStore>,
}

impl WebhookState {
    /// Create webhook state from engine settings and a ConfigMap store
    pub fn new(config: EngineConfig, configmaps: Arc<dyn ConfigMapStore>) -> Self {
        Self { config, configmaps }
    }
}

/// Create the webhook router with all admission endpoints and `/healthz`
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    let mut router = Router::new().route("/healthz", get(|| async { "ok" }));

    for capability in Capability::ALL {
        for mode in Mode::ALL {
            let path = format!("/{mode}/{}", capability.route_segment());
            router = router.route(
                &path,
                post(move |State(state): State<Arc<WebhookState>>, body: Bytes| {
                    review_handler(state, capability, mode, body)
                }),
            );
        }
    }

    router.fallback(not_found).with_state(state)
}

/// Decode a review, dispatch it and wrap the response
async fn review_handler(
    state: Arc<WebhookState>,
    capability: Capability,
    mode: Mode,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            warn!(capability = %capability, mode = %mode, error = %e, "Malformed admission review body");
            return Json(undecodable_review(&body, &e));
        }
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = dispatch::admit(&state, capability, mode, &request).await;
    Json(response.into_review())
}

/// Deny a review whose body did not fit `AdmissionReview<DynamicObject>`
///
/// When the body is still JSON, the uid and review type meta are copied from
/// it so the API server can match the denial to its request.
fn undecodable_review(body: &[u8], err: &serde_json::Error) -> AdmissionReview<DynamicObject> {
    let Ok(raw) = serde_json::from_slice::<Value>(body) else {
        return AdmissionResponse::invalid(format!("cannot decode AdmissionReview: {err}"))
            .into_review();
    };

    let text = |pointer: &str| {
        raw.pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let kind = match text("/request/kind/kind") {
        kind if kind.is_empty() => "AdmissionReview".to_string(),
        kind => kind,
    };

    let mut response = AdmissionResponse::invalid(AdmissionError::Decode {
        kind,
        message: err.to_string(),
    });
    response.uid = text("/request/uid");
    if let (Some(api_version), Some(review_kind)) = (
        raw.get("apiVersion").and_then(Value::as_str),
        raw.get("kind").and_then(Value::as_str),
    ) {
        response.types = TypeMeta {
            api_version: api_version.to_string(),
            kind: review_kind.to_string(),
        };
    }
    response.into_review()
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "404 Not Found"})),
    )
}
