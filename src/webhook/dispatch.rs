//! Routing of admission requests to capability evaluators
//!
//! Each webhook route is a `(Capability, Mode)` pair. The pair accepts a
//! fixed set of resource kinds and operations; anything else is admitted
//! unchanged so a misconfigured webhook rule never blocks unrelated objects.

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::decision::{AdmissionError, Decision};
use super::WebhookState;
use crate::capability::log_sidecar::{self, WorkloadRef};
use crate::capability::{endpoint_extend, fix_pod_ip};

/// Feature implemented by a pair of webhook routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Static node and IP per StatefulSet ordinal
    FixPodIp,
    /// External and backup endpoint addresses
    EndpointExtend,
    /// Log/metrics sidecar injection
    LogSidecar,
}

impl Capability {
    /// Every capability, in route registration order
    pub const ALL: [Capability; 3] = [
        Capability::FixPodIp,
        Capability::EndpointExtend,
        Capability::LogSidecar,
    ];

    /// Path segment naming the capability in its routes
    pub fn route_segment(self) -> &'static str {
        match self {
            Capability::FixPodIp => "fixpodip",
            Capability::EndpointExtend => "endpointextendip",
            Capability::LogSidecar => "injectlogsidecar",
        }
    }

    /// Whether this route handles `kind` on `operation`
    pub fn accepts(self, mode: Mode, kind: ResourceKind, operation: &Operation) -> bool {
        let create_or_update = matches!(operation, Operation::Create | Operation::Update);
        match (self, mode) {
            (Capability::FixPodIp, Mode::Mutate) => {
                kind == ResourceKind::Pod && matches!(operation, Operation::Create)
            }
            (Capability::FixPodIp, Mode::Validate) => {
                kind == ResourceKind::StatefulSet && create_or_update
            }
            (Capability::EndpointExtend, Mode::Mutate) => {
                kind == ResourceKind::Endpoints && create_or_update
            }
            (Capability::EndpointExtend, Mode::Validate) => {
                kind == ResourceKind::Service && create_or_update
            }
            (Capability::LogSidecar, Mode::Mutate) => {
                kind == ResourceKind::Pod && matches!(operation, Operation::Create)
            }
            (Capability::LogSidecar, Mode::Validate) => {
                matches!(kind, ResourceKind::Deployment | ResourceKind::StatefulSet)
                    && (create_or_update || matches!(operation, Operation::Delete))
            }
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route_segment())
    }
}

/// Mutating or validating half of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// May return a patch
    Mutate,
    /// Allow or deny only
    Validate,
}

impl Mode {
    /// Both modes
    pub const ALL: [Mode; 2] = [Mode::Mutate, Mode::Validate];
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Mutate => write!(f, "mutate"),
            Mode::Validate => write!(f, "validate"),
        }
    }
}

/// Resource kinds any route evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// core/v1 Pod
    Pod,
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// core/v1 Service
    Service,
    /// core/v1 Endpoints
    Endpoints,
}

impl ResourceKind {
    /// Parse the `kind` of a request GVK
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Pod" => Some(Self::Pod),
            "Deployment" => Some(Self::Deployment),
            "StatefulSet" => Some(Self::StatefulSet),
            "Service" => Some(Self::Service),
            "Endpoints" => Some(Self::Endpoints),
            _ => None,
        }
    }

    /// apiVersion of the typed representation
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Pod | Self::Service | Self::Endpoints => "v1",
            Self::Deployment | Self::StatefulSet => "apps/v1",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Pod => "Pod",
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::Service => "Service",
            Self::Endpoints => "Endpoints",
        };
        f.write_str(kind)
    }
}

/// Evaluate one admission request and build its response
pub async fn admit(
    state: &WebhookState,
    capability: Capability,
    mode: Mode,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let username = request.user_info.username.as_deref().unwrap_or("<unknown>");
    info!(
        capability = %capability,
        mode = %mode,
        uid = %request.uid,
        kind = %request.kind.kind,
        namespace = ?request.namespace,
        name = %request.name,
        operation = ?request.operation,
        user = %username,
        "Admission review"
    );

    let decision = evaluate(state, capability, mode, request).await;

    if decision.allowed {
        info!(
            uid = %request.uid,
            allowed = true,
            patch_ops = decision.patch.len(),
            "Admission decided"
        );
    } else {
        warn!(
            uid = %request.uid,
            allowed = false,
            reason = decision.reason.as_deref().unwrap_or_default(),
            "Admission denied"
        );
    }

    decision.into_response(request)
}

async fn evaluate(
    state: &WebhookState,
    capability: Capability,
    mode: Mode,
    request: &AdmissionRequest<DynamicObject>,
) -> Decision {
    let Some(kind) = ResourceKind::from_kind(&request.kind.kind) else {
        debug!(kind = %request.kind.kind, "Unrecognized kind, allowing unchanged");
        return Decision::allow();
    };
    if !capability.accepts(mode, kind, &request.operation) {
        debug!(
            kind = %kind,
            operation = ?request.operation,
            "Kind or operation not handled by this route, allowing unchanged"
        );
        return Decision::allow();
    }

    match (capability, mode) {
        (Capability::FixPodIp, Mode::Mutate) => object::<Pod>(kind, request)
            .and_then(|pod| fix_pod_ip::mutate(&pod))
            .into(),
        (Capability::FixPodIp, Mode::Validate) => object::<StatefulSet>(kind, request)
            .and_then(|sts| fix_pod_ip::validate(&sts))
            .into(),
        (Capability::EndpointExtend, Mode::Mutate) => object::<Endpoints>(kind, request)
            .and_then(|ep| endpoint_extend::mutate(&ep, state.config.emptied_subset_policy))
            .into(),
        (Capability::EndpointExtend, Mode::Validate) => object::<Service>(kind, request)
            .and_then(|svc| endpoint_extend::validate(&svc))
            .into(),
        (Capability::LogSidecar, Mode::Mutate) => object::<Pod>(kind, request)
            .and_then(|pod| log_sidecar::mutate(&pod, &state.config))
            .into(),
        (Capability::LogSidecar, Mode::Validate) => {
            validate_workload(state, kind, request).await.into()
        }
    }
}

async fn validate_workload(
    state: &WebhookState,
    kind: ResourceKind,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<(), AdmissionError> {
    let store = state.configmaps.as_ref();
    let namespace = request
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| {
            AdmissionError::semantic(format!(
                "{kind} '{}' has no namespace; the script ConfigMap cannot be placed",
                request.name
            ))
        })?;

    if matches!(request.operation, Operation::Delete) {
        log_sidecar::release(store, &request.name, namespace).await;
        return Ok(());
    }

    match kind {
        ResourceKind::Deployment => {
            let deployment: Deployment = object(kind, request)?;
            let workload = WorkloadRef {
                name: deployment.metadata.name.as_deref().unwrap_or(&request.name),
                namespace,
                labels: deployment.metadata.labels.as_ref(),
                template_annotations: deployment
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.metadata.as_ref())
                    .and_then(|m| m.annotations.as_ref()),
            };
            log_sidecar::validate(store, workload).await
        }
        ResourceKind::StatefulSet => {
            let statefulset: StatefulSet = object(kind, request)?;
            let workload = WorkloadRef {
                name: statefulset.metadata.name.as_deref().unwrap_or(&request.name),
                namespace,
                labels: statefulset.metadata.labels.as_ref(),
                template_annotations: statefulset
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.metadata.as_ref())
                    .and_then(|m| m.annotations.as_ref()),
            };
            log_sidecar::validate(store, workload).await
        }
        _ => Ok(()),
    }
}

/// Decode the request object into its typed representation
fn object<K: DeserializeOwned>(
    kind: ResourceKind,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<K, AdmissionError> {
    let dynamic = request.object.as_ref().ok_or_else(|| AdmissionError::Decode {
        kind: kind.to_string(),
        message: "request carries no object".to_string(),
    })?;
    decode(kind, dynamic)
}

/// Convert a dynamic object into `K`, filling in the type meta the typed
/// deserializer requires when the raw object omits it
pub fn decode<K: DeserializeOwned>(
    kind: ResourceKind,
    dynamic: &DynamicObject,
) -> Result<K, AdmissionError> {
    let decode_error = |e: serde_json::Error| AdmissionError::Decode {
        kind: kind.to_string(),
        message: e.to_string(),
    };

    let mut value = serde_json::to_value(dynamic).map_err(decode_error)?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(kind.api_version().to_string()));
        map.entry("kind")
            .or_insert_with(|| Value::String(kind.to_string()));
    }
    serde_json::from_value(value).map_err(decode_error)
}
