//! ConfigMap gateway for the log sidecar's per-workload metrics script
//!
//! The only Kubernetes writes this webhook makes go through [`ConfigMapStore`].
//! Not-found and already-exists are reported as outcomes rather than errors:
//! the create-if-absent sequence is a non-atomic get-then-create, and two pods
//! of a new workload admitted concurrently can both reach the create.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Label marking ConfigMaps created by this webhook
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "preset-admission";

/// Result of a create call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The ConfigMap was created by this call
    Created,
    /// Another writer created it first
    AlreadyExists,
}

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The ConfigMap was deleted by this call
    Deleted,
    /// There was nothing to delete
    NotFound,
}

/// Key-value config object store keyed by `(name, namespace)`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Fetch a ConfigMap, `None` when it does not exist
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap holding `data`
    async fn create(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, String>,
    ) -> Result<CreateOutcome, Error>;

    /// Delete a ConfigMap
    async fn delete(&self, name: &str, namespace: &str) -> Result<DeleteOutcome, Error>;
}

/// [`ConfigMapStore`] backed by the Kubernetes API
///
/// Holds the process-wide client; each call is retried with bounded backoff.
pub struct KubeConfigMapStore {
    client: Client,
    retry: RetryConfig,
}

impl KubeConfigMapStore {
    /// Wrap a long-lived client
    pub fn new(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Whether a failed API call may succeed if repeated
///
/// Client-side 4xx responses other than 429 describe the request itself, so
/// repeating them only spends the admission deadline.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(e) => e.code == 429 || e.code >= 500,
        kube::Error::SerdeError(_) => false,
        _ => true,
    }
}

/// Build the ConfigMap object created for a workload
pub fn managed_config_map(name: &str, namespace: &str, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>, Error> {
        let api = &self.api(namespace);
        let found = retry_with_backoff(&self.retry, "get_configmap", is_transient, || async move {
            api.get_opt(name).await
        })
        .await?;

        debug!(name, namespace, found = found.is_some(), "Looked up ConfigMap");
        Ok(found)
    }

    async fn create(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, String>,
    ) -> Result<CreateOutcome, Error> {
        let api = &self.api(namespace);
        let config_map = &managed_config_map(name, namespace, data);

        let outcome = retry_with_backoff(&self.retry, "create_configmap", is_transient, || async move {
            match api.create(&PostParams::default(), config_map).await {
                Ok(_) => Ok(CreateOutcome::Created),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(CreateOutcome::AlreadyExists),
                Err(e) => Err(e),
            }
        })
        .await?;

        Ok(outcome)
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<DeleteOutcome, Error> {
        let api = &self.api(namespace);

        let outcome = retry_with_backoff(&self.retry, "delete_configmap", is_transient, || async move {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(DeleteOutcome::Deleted),
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(DeleteOutcome::NotFound),
                Err(e) => Err(e),
            }
        })
        .await?;

        Ok(outcome)
    }
}
