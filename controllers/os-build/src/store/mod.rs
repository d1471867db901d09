//! Cluster object store.
//!
//! Every read and write the controller performs goes through [`ClusterStore`].
//! Writes carry the object's resource version, so a stale read-modify-write
//! surfaces as [`StoreError::Conflict`] instead of silently overwriting.

mod kube_store;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use kube_store::KubeClusterStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterStore;

use crds::{BuildConfiguration, BuildRecord, NodePool, RenderedConfig};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use thiserror::Error;

/// Errors returned by a [`ClusterStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Target object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Create raced with an existing object of the same name
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Write was based on a stale resource version
    #[error("conflicting write to {0}")]
    Conflict(String),

    /// Any other API failure
    #[error("Kubernetes error on {0}: {1}")]
    Api(String, #[source] kube::Error),

    /// Failure not originating from the API server
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Classifies a kube error for `target` (e.g. `secret/pull-secret`).
    pub fn from_kube(target: impl Into<String>, err: kube::Error) -> Self {
        let target = target.into();
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(target),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(target)
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(target),
            _ => StoreError::Api(target, err),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Typed access to every object kind the controller touches.
///
/// Cluster-scoped kinds (configurations, records, pools, rendered configs) are
/// addressed by name; namespaced kinds live in the controller namespace.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    // BuildConfiguration
    async fn get_build_configuration(&self, name: &str) -> Result<BuildConfiguration, StoreError>;
    async fn list_build_configurations(&self) -> Result<Vec<BuildConfiguration>, StoreError>;
    /// Replaces the spec; the resource version must be current.
    async fn update_build_configuration(
        &self,
        config: &BuildConfiguration,
    ) -> Result<BuildConfiguration, StoreError>;
    /// Writes only the status subresource.
    async fn update_build_configuration_status(
        &self,
        config: &BuildConfiguration,
    ) -> Result<BuildConfiguration, StoreError>;

    // BuildRecord
    async fn get_build_record(&self, name: &str) -> Result<BuildRecord, StoreError>;
    async fn list_build_records(&self) -> Result<Vec<BuildRecord>, StoreError>;
    async fn create_build_record(&self, record: &BuildRecord) -> Result<BuildRecord, StoreError>;
    async fn update_build_record_status(
        &self,
        record: &BuildRecord,
    ) -> Result<BuildRecord, StoreError>;
    async fn delete_build_record(&self, name: &str) -> Result<(), StoreError>;

    // NodePool
    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError>;
    async fn update_node_pool(&self, pool: &NodePool) -> Result<NodePool, StoreError>;

    // RenderedConfig
    async fn get_rendered_config(&self, name: &str) -> Result<RenderedConfig, StoreError>;

    // Secret
    async fn get_secret(&self, name: &str) -> Result<Secret, StoreError>;
    async fn list_secrets(&self, label_selector: &str) -> Result<Vec<Secret>, StoreError>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;

    // ConfigMap
    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, StoreError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;
    async fn delete_config_map(&self, name: &str) -> Result<(), StoreError>;

    // Pod
    async fn get_pod(&self, name: &str) -> Result<Pod, StoreError>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
    async fn delete_pod(&self, name: &str) -> Result<(), StoreError>;
}

/// Converts a `get` result into `Ok(None)` when the object is absent.
pub fn optional<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
