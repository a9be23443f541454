//! Log/metrics sidecar injection
//!
//! Pods labelled `log-injection=enabled` get a sidecar that tails the
//! business containers' log directory and runs a per-workload metrics script
//! mounted from a ConfigMap named after the workload. The Deployment or
//! StatefulSet admission owns that ConfigMap: it is created when the
//! workload enables the capability and deleted when the workload disables it
//! or is deleted.

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{lookup, required};
use crate::config::EngineConfig;
use crate::gateway::{ConfigMapStore, CreateOutcome, DeleteOutcome};
use crate::patch::{pointer, ArrayField, MapField};
use crate::webhook::{to_value, AdmissionError, Source};

/// Label toggling the capability
pub const LOG_INJECTION_LABEL: &str = "log-injection";

/// `log-injection` value that enables the capability
pub const ENABLED: &str = "enabled";

/// Pod annotation overriding the metrics script interval, in seconds
pub const METRIC_INTERVAL_ANNOTATION: &str = "metric-interval";

/// Annotation naming the business containers' log directory
pub const LOG_FILE_DIRECTORY_ANNOTATION: &str = "log-file-directory";

/// Metrics interval used when the pod does not override it
pub const DEFAULT_METRIC_INTERVAL: &str = "60";

/// Log directory used when the pod does not override it
pub const DEFAULT_LOG_FILE_DIRECTORY: &str = "/var/log";

/// Name of the injected container
pub const SIDECAR_NAME: &str = "log-metrics-sidecar";

/// Volume holding the metrics script ConfigMap
pub const SCRIPT_VOLUME: &str = "log-metrics-script";

/// Shared emptyDir volume for business logs
pub const LOG_VOLUME: &str = "log-file-directory";

/// Where the sidecar sees the metrics script
pub const SCRIPT_MOUNT_PATH: &str = "/etc/log-metrics";

/// ConfigMap key holding the metrics script
pub const SCRIPT_KEY: &str = "metrics.sh";

/// Pod annotation recording which ConfigMap backs the script volume
pub const SCRIPT_ANNOTATION: &str = "log-injection/script";

/// Script placed in a newly provisioned ConfigMap. Output files must be
/// written under `/tmp` with a `.prom` suffix.
pub const METRICS_SCRIPT: &str = "#!/bin/sh\n\
# Write metrics to /tmp/<name>.prom in the Prometheus text format\n\
echo 'qps{business=\"example\",product=\"example_product\"} 90' > /tmp/example.prom\n";

/// Workload fields the ConfigMap lifecycle depends on
#[derive(Debug, Clone, Copy)]
pub struct WorkloadRef<'a> {
    /// Workload name, also the ConfigMap name
    pub name: &'a str,
    /// Workload namespace
    pub namespace: &'a str,
    /// Workload labels
    pub labels: Option<&'a BTreeMap<String, String>>,
    /// Pod template annotations
    pub template_annotations: Option<&'a BTreeMap<String, String>>,
}

/// Inject the sidecar, its volumes and scrape annotations into a pod
pub fn mutate(pod: &Pod, config: &EngineConfig) -> Result<Vec<PatchOperation>, AdmissionError> {
    if lookup(pod.metadata.labels.as_ref(), LOG_INJECTION_LABEL) != Some(ENABLED) {
        return Ok(Vec::new());
    }
    let Some(spec) = pod.spec.as_ref() else {
        return Err(AdmissionError::semantic("pod has no spec"));
    };
    if spec.containers.iter().any(|c| c.name == SIDECAR_NAME) {
        debug!(pod = ?pod.metadata.name, "Sidecar already injected");
        return Ok(Vec::new());
    }

    let workload = workload_name(pod)?;
    let annotations = pod.metadata.annotations.as_ref();
    let interval = lookup(annotations, METRIC_INTERVAL_ANNOTATION).unwrap_or(DEFAULT_METRIC_INTERVAL);
    let log_dir = lookup(annotations, LOG_FILE_DIRECTORY_ANNOTATION)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_LOG_FILE_DIRECTORY);

    let mut ops = Vec::new();

    let mut volumes = ArrayField::of(pointer(["spec", "volumes"]), spec.volumes.as_ref());
    ops.push(volumes.push(json!({
        "name": SCRIPT_VOLUME,
        "configMap": {"name": workload, "defaultMode": 0o755}
    })));
    ops.push(volumes.push(json!({"name": LOG_VOLUME, "emptyDir": {}})));

    let mut containers = ArrayField::of(pointer(["spec", "containers"]), Some(&spec.containers));
    ops.push(containers.push(sidecar(config, interval, log_dir)));

    for (index, container) in spec.containers.iter().enumerate() {
        let mut path = containers.element(index);
        path.push_back("volumeMounts");
        let mut mounts = ArrayField::of(path, container.volume_mounts.as_ref());
        ops.push(mounts.push(json!({"name": LOG_VOLUME, "mountPath": log_dir})));
    }

    let mut pod_annotations = MapField::of(pointer(["metadata", "annotations"]), annotations);
    for (key, value) in [
        ("prometheus.io/scrape", "true".to_string()),
        ("prometheus.io/path", "/metrics".to_string()),
        ("prometheus.io/port", config.metrics_port.to_string()),
        ("prometheus.io/scheme", "http".to_string()),
        (SCRIPT_ANNOTATION, workload.clone()),
    ] {
        ops.push(pod_annotations.insert(key, to_value(&value)?));
    }

    debug!(
        pod = ?pod.metadata.name,
        workload = %workload,
        patch_ops = ops.len(),
        "Injecting log sidecar"
    );
    Ok(ops)
}

fn sidecar(config: &EngineConfig, interval: &str, log_dir: &str) -> Value {
    json!({
        "name": SIDECAR_NAME,
        "image": config.sidecar_image,
        "env": [
            {"name": "metricInterval", "value": interval},
            {"name": "logFileDirectory", "value": log_dir}
        ],
        "ports": [
            {"name": "metrics", "containerPort": config.metrics_port, "protocol": "TCP"}
        ],
        "volumeMounts": [
            {"name": SCRIPT_VOLUME, "mountPath": SCRIPT_MOUNT_PATH, "readOnly": true},
            {"name": LOG_VOLUME, "mountPath": log_dir}
        ]
    })
}

/// Name of the workload owning a pod
///
/// The owning StatefulSet when there is one; otherwise the generate-name with
/// its ReplicaSet and pod-template hash segments removed.
pub fn workload_name(pod: &Pod) -> Result<String, AdmissionError> {
    if let Some(owner) = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.kind == "StatefulSet")
    {
        return Ok(owner.name.clone());
    }

    let generate_name = pod.metadata.generate_name.as_deref().unwrap_or_default();
    let mut parts = generate_name.rsplitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(name)) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(AdmissionError::semantic(format!(
            "cannot derive workload name from pod generateName '{generate_name}'"
        ))),
    }
}

/// Enforce the log directory annotation and keep the script ConfigMap in
/// step with the workload's `log-injection` label
pub async fn validate(
    store: &dyn ConfigMapStore,
    workload: WorkloadRef<'_>,
) -> Result<(), AdmissionError> {
    if lookup(workload.labels, LOG_INJECTION_LABEL) != Some(ENABLED) {
        release(store, workload.name, workload.namespace).await;
        return Ok(());
    }

    let dir = required(
        workload.template_annotations,
        LOG_FILE_DIRECTORY_ANNOTATION,
        Source::TemplateAnnotation,
    )?;
    if dir.is_empty() {
        return Err(AdmissionError::Empty {
            origin: Source::TemplateAnnotation,
            key: LOG_FILE_DIRECTORY_ANNOTATION,
        });
    }

    provision(store, workload.name, workload.namespace).await
}

/// Create the script ConfigMap unless it already exists
pub async fn provision(
    store: &dyn ConfigMapStore,
    name: &str,
    namespace: &str,
) -> Result<(), AdmissionError> {
    match store.get(name, namespace).await {
        Ok(Some(_)) => {
            debug!(name, namespace, "Script ConfigMap present");
            return Ok(());
        }
        Ok(None) => {}
        Err(e) => {
            warn!(name, namespace, error = %e, "ConfigMap lookup failed, attempting create");
        }
    }

    let data = BTreeMap::from([(SCRIPT_KEY.to_string(), METRICS_SCRIPT.to_string())]);
    match store.create(name, namespace, data).await {
        Ok(CreateOutcome::Created) => {
            info!(name, namespace, "Created script ConfigMap");
            Ok(())
        }
        Ok(CreateOutcome::AlreadyExists) => {
            debug!(name, namespace, "Script ConfigMap created concurrently");
            Ok(())
        }
        Err(e) => {
            error!(name, namespace, error = %e, "Failed to create script ConfigMap");
            Err(AdmissionError::external_resource(format!(
                "create ConfigMap '{name}' failed: {e}"
            )))
        }
    }
}

/// Delete the script ConfigMap, logging rather than failing
pub async fn release(store: &dyn ConfigMapStore, name: &str, namespace: &str) {
    match store.delete(name, namespace).await {
        Ok(DeleteOutcome::Deleted) => info!(name, namespace, "Deleted script ConfigMap"),
        Ok(DeleteOutcome::NotFound) => debug!(name, namespace, "No script ConfigMap to delete"),
        Err(e) => error!(name, namespace, error = %e, "Failed to delete script ConfigMap"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockConfigMapStore;
    use crate::Error;

    fn pod(raw: Value) -> Pod {
        serde_json::from_value(raw).unwrap()
    }

    fn deployment_pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "generateName": "checkout-7d4b9c8f5d-",
                "namespace": "shop",
                "labels": {"log-injection": "enabled"}
            },
            "spec": {"containers": [{"name": "app", "image": "checkout:1"}]}
        })
    }

    fn labels(enabled: bool) -> BTreeMap<String, String> {
        let value = if enabled { ENABLED } else { "disabled" };
        BTreeMap::from([(LOG_INJECTION_LABEL.to_string(), value.to_string())])
    }

    fn template(dir: Option<&str>) -> BTreeMap<String, String> {
        dir.map(|d| BTreeMap::from([(LOG_FILE_DIRECTORY_ANNOTATION.to_string(), d.to_string())]))
            .unwrap_or_default()
    }

    // ==========================================================================
    // Story: pod admission injects the sidecar
    // ==========================================================================

    /// Story: a bare deployment pod gets volumes, sidecar, mount and annotations
    #[test]
    fn story_bare_pod_gets_full_injection() {
        let raw = deployment_pod();
        let ops = mutate(&pod(raw.clone()), &EngineConfig::default()).unwrap();

        let mut doc = raw;
        json_patch::patch(&mut doc, &ops).expect("patch applies");

        let volumes = doc["spec"]["volumes"].as_array().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0]["configMap"]["name"], json!("checkout"));
        assert_eq!(volumes[0]["configMap"]["defaultMode"], json!(493));
        assert_eq!(volumes[1]["emptyDir"], json!({}));

        let containers = doc["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        let sidecar = &containers[1];
        assert_eq!(sidecar["name"], json!(SIDECAR_NAME));
        assert_eq!(
            sidecar["env"][0],
            json!({"name": "metricInterval", "value": "60"})
        );
        assert_eq!(
            containers[0]["volumeMounts"],
            json!([{"name": LOG_VOLUME, "mountPath": "/var/log"}])
        );

        let annotations = doc["metadata"]["annotations"].as_object().unwrap();
        assert_eq!(annotations.len(), 5);
        assert_eq!(annotations["prometheus.io/port"], json!("9100"));
        assert_eq!(annotations[SCRIPT_ANNOTATION], json!("checkout"));
    }

    /// Story: annotations override interval and log directory
    #[test]
    fn story_annotations_override_defaults() {
        let mut raw = deployment_pod();
        raw["metadata"]["annotations"] = json!({
            "metric-interval": "15",
            "log-file-directory": "/data/logs"
        });
        raw["spec"]["containers"][0]["volumeMounts"] =
            json!([{"name": "data", "mountPath": "/data"}]);
        raw["spec"]["volumes"] = json!([{"name": "data", "emptyDir": {}}]);

        let ops = mutate(&pod(raw.clone()), &EngineConfig::default()).unwrap();
        let mut doc = raw;
        json_patch::patch(&mut doc, &ops).expect("patch applies");

        assert_eq!(doc["spec"]["volumes"].as_array().unwrap().len(), 3);
        assert_eq!(
            doc["spec"]["containers"][0]["volumeMounts"][1],
            json!({"name": LOG_VOLUME, "mountPath": "/data/logs"})
        );
        assert_eq!(
            doc["spec"]["containers"][1]["env"][0]["value"],
            json!("15")
        );
        // Existing annotations are kept alongside the five added ones
        assert_eq!(doc["metadata"]["annotations"].as_object().unwrap().len(), 7);
    }

    #[test]
    fn test_disabled_or_reinjected_pods_are_untouched() {
        let mut raw = deployment_pod();
        raw["metadata"]["labels"]["log-injection"] = json!("disabled");
        assert!(mutate(&pod(raw), &EngineConfig::default()).unwrap().is_empty());

        let mut raw = deployment_pod();
        raw["spec"]["containers"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": SIDECAR_NAME, "image": "x"}));
        assert!(mutate(&pod(raw), &EngineConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_workload_name_derivation() {
        assert_eq!(workload_name(&pod(deployment_pod())).unwrap(), "checkout");

        let mut raw = deployment_pod();
        raw["metadata"]["generateName"] = json!("my-app-7d4b9c8f5d-");
        assert_eq!(workload_name(&pod(raw)).unwrap(), "my-app");

        let mut raw = deployment_pod();
        raw["metadata"]["generateName"] = json!("db-");
        raw["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "name": "db",
            "uid": "1234"
        }]);
        assert_eq!(workload_name(&pod(raw)).unwrap(), "db");

        let mut raw = deployment_pod();
        raw["metadata"]["generateName"] = json!("solo");
        assert!(workload_name(&pod(raw)).is_err());
    }

    // ==========================================================================
    // Story: workload admission manages the script ConfigMap
    // ==========================================================================

    /// Story: enabling the capability provisions the ConfigMap once
    #[tokio::test]
    async fn story_enabled_workload_provisions_configmap() {
        let mut store = MockConfigMapStore::new();
        store
            .expect_get()
            .withf(|name, ns| name == "checkout" && ns == "shop")
            .times(1)
            .returning(|_, _| Ok(None));
        store
            .expect_create()
            .withf(|name, _, data| name == "checkout" && data.contains_key(SCRIPT_KEY))
            .times(1)
            .returning(|_, _, _| Ok(CreateOutcome::Created));

        let labels = labels(true);
        let template = template(Some("/var/log/app"));
        let result = validate(
            &store,
            WorkloadRef {
                name: "checkout",
                namespace: "shop",
                labels: Some(&labels),
                template_annotations: Some(&template),
            },
        )
        .await;
        assert!(result.is_ok());
    }

    /// Story: an existing ConfigMap is not recreated
    #[tokio::test]
    async fn story_existing_configmap_is_reused() {
        let mut store = MockConfigMapStore::new();
        store
            .expect_get()
            .returning(|name, ns| Ok(Some(crate::gateway::managed_config_map(name, ns, BTreeMap::new()))));
        store.expect_create().never();

        assert!(provision(&store, "checkout", "shop").await.is_ok());
    }

    /// Story: a concurrent creator winning the race is fine
    #[tokio::test]
    async fn story_already_exists_is_tolerated() {
        let mut store = MockConfigMapStore::new();
        store.expect_get().returning(|_, _| Ok(None));
        store
            .expect_create()
            .returning(|_, _, _| Ok(CreateOutcome::AlreadyExists));

        assert!(provision(&store, "checkout", "shop").await.is_ok());
    }

    /// Story: a failed lookup still attempts creation
    #[tokio::test]
    async fn story_lookup_failure_falls_through_to_create() {
        let mut store = MockConfigMapStore::new();
        store
            .expect_get()
            .returning(|_, _| Err(Error::external_resource("timeout")));
        store
            .expect_create()
            .times(1)
            .returning(|_, _, _| Ok(CreateOutcome::Created));

        assert!(provision(&store, "checkout", "shop").await.is_ok());
    }

    /// Story: creation failure denies and names the ConfigMap
    #[tokio::test]
    async fn story_creation_failure_denies() {
        let mut store = MockConfigMapStore::new();
        store.expect_get().returning(|_, _| Ok(None));
        store
            .expect_create()
            .returning(|_, _, _| Err(Error::external_resource("forbidden")));

        let err = provision(&store, "checkout", "shop").await.unwrap_err();
        assert!(matches!(err, AdmissionError::ExternalResource(_)));
        assert!(err.to_string().contains("'checkout'"));
        assert!(err.to_string().contains("forbidden"));
    }

    /// Story: disabling the capability removes the ConfigMap, failures only log
    #[tokio::test]
    async fn story_disabled_workload_releases_configmap() {
        let mut store = MockConfigMapStore::new();
        store
            .expect_delete()
            .withf(|name, ns| name == "checkout" && ns == "shop")
            .times(1)
            .returning(|_, _| Err(Error::external_resource("connection refused")));
        store.expect_get().never();

        let labels = labels(false);
        let result = validate(
            &store,
            WorkloadRef {
                name: "checkout",
                namespace: "shop",
                labels: Some(&labels),
                template_annotations: None,
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_enabled_workload_requires_log_directory() {
        let store = MockConfigMapStore::new();
        let labels = labels(true);

        let missing = template(None);
        let err = validate(
            &store,
            WorkloadRef {
                name: "checkout",
                namespace: "shop",
                labels: Some(&labels),
                template_annotations: Some(&missing),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "required spec.template annotation 'log-file-directory' is not set"
        );

        let empty = template(Some(""));
        let err = validate(
            &store,
            WorkloadRef {
                name: "checkout",
                namespace: "shop",
                labels: Some(&labels),
                template_annotations: Some(&empty),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdmissionError::Empty { .. }));
    }
}
