//! [`ClusterStore`] backed by the Kubernetes API.

use super::{ClusterStore, StoreError};
use crds::{BuildConfiguration, BuildRecord, NodePool, RenderedConfig};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

/// Kubernetes-backed store.
#[derive(Clone)]
pub struct KubeClusterStore {
    configs: Api<BuildConfiguration>,
    records: Api<BuildRecord>,
    pools: Api<NodePool>,
    rendered: Api<RenderedConfig>,
    secrets: Api<Secret>,
    config_maps: Api<ConfigMap>,
    pods: Api<Pod>,
}

impl KubeClusterStore {
    /// Creates a store for cluster-scoped CRDs plus core objects in `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configs: Api::all(client.clone()),
            records: Api::all(client.clone()),
            pools: Api::all(client.clone()),
            rendered: Api::all(client.clone()),
            secrets: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }
}

fn target(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

#[async_trait::async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_build_configuration(&self, name: &str) -> Result<BuildConfiguration, StoreError> {
        self.configs
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("buildconfiguration", name), e))
    }

    async fn list_build_configurations(&self) -> Result<Vec<BuildConfiguration>, StoreError> {
        Ok(self
            .configs
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::from_kube("buildconfigurations", e))?
            .items)
    }

    async fn update_build_configuration(
        &self,
        config: &BuildConfiguration,
    ) -> Result<BuildConfiguration, StoreError> {
        let name = config.name_any();
        self.configs
            .replace(&name, &PostParams::default(), config)
            .await
            .map_err(|e| StoreError::from_kube(target("buildconfiguration", &name), e))
    }

    async fn update_build_configuration_status(
        &self,
        config: &BuildConfiguration,
    ) -> Result<BuildConfiguration, StoreError> {
        let name = config.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": config.metadata.resource_version },
            "status": config.status,
        });
        self.configs
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(target("buildconfiguration", &name), e))
    }

    async fn get_build_record(&self, name: &str) -> Result<BuildRecord, StoreError> {
        self.records
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("buildrecord", name), e))
    }

    async fn list_build_records(&self) -> Result<Vec<BuildRecord>, StoreError> {
        Ok(self
            .records
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::from_kube("buildrecords", e))?
            .items)
    }

    async fn create_build_record(&self, record: &BuildRecord) -> Result<BuildRecord, StoreError> {
        self.records
            .create(&PostParams::default(), record)
            .await
            .map_err(|e| StoreError::from_kube(target("buildrecord", &record.name_any()), e))
    }

    async fn update_build_record_status(
        &self,
        record: &BuildRecord,
    ) -> Result<BuildRecord, StoreError> {
        let name = record.name_any();
        // Merge patches replace lists wholesale, so the condition vector is
        // always written in one piece
        let patch = json!({
            "metadata": { "resourceVersion": record.metadata.resource_version },
            "status": record.status,
        });
        self.records
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(target("buildrecord", &name), e))
    }

    async fn delete_build_record(&self, name: &str) -> Result<(), StoreError> {
        self.records
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(target("buildrecord", name), e))
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError> {
        self.pools
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("nodepool", name), e))
    }

    async fn update_node_pool(&self, pool: &NodePool) -> Result<NodePool, StoreError> {
        let name = pool.name_any();
        self.pools
            .replace(&name, &PostParams::default(), pool)
            .await
            .map_err(|e| StoreError::from_kube(target("nodepool", &name), e))
    }

    async fn get_rendered_config(&self, name: &str) -> Result<RenderedConfig, StoreError> {
        self.rendered
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("renderedconfig", name), e))
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, StoreError> {
        self.secrets
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("secret", name), e))
    }

    async fn list_secrets(&self, label_selector: &str) -> Result<Vec<Secret>, StoreError> {
        Ok(self
            .secrets
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| StoreError::from_kube("secrets", e))?
            .items)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.secrets
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| StoreError::from_kube(target("secret", &secret.name_any()), e))
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.name_any();
        self.secrets
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| StoreError::from_kube(target("secret", &name), e))
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, StoreError> {
        self.config_maps
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("configmap", name), e))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.config_maps
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| StoreError::from_kube(target("configmap", &config_map.name_any()), e))
    }

    async fn delete_config_map(&self, name: &str) -> Result<(), StoreError> {
        self.config_maps
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(target("configmap", name), e))
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, StoreError> {
        self.pods
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(target("pod", name), e))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.pods
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| StoreError::from_kube(target("pod", &pod.name_any()), e))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), StoreError> {
        self.pods
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(target("pod", name), e))
    }
}
