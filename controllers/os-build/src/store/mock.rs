//! In-memory [`ClusterStore`] for unit testing
//!
//! Objects are kept per kind in maps keyed by name. Every write bumps a
//! global resource version, and updates carrying a stale version fail with
//! [`StoreError::Conflict`] the way the API server does. Tests can queue
//! errors for specific operations and read per-operation call counts.

use super::{ClusterStore, StoreError};
use crds::{BuildConfiguration, BuildRecord, NodePool, RenderedConfig};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Objects<T> = Arc<Mutex<BTreeMap<String, T>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock cluster store
#[derive(Clone, Default)]
pub struct MockClusterStore {
    pub(crate) configs: Objects<BuildConfiguration>,
    pub(crate) records: Objects<BuildRecord>,
    pub(crate) pools: Objects<NodePool>,
    pub(crate) rendered: Objects<RenderedConfig>,
    pub(crate) secrets: Objects<Secret>,
    pub(crate) config_maps: Objects<ConfigMap>,
    pub(crate) pods: Objects<Pod>,
    next_version: Arc<Mutex<u64>>,
    faults: Arc<Mutex<HashMap<&'static str, VecDeque<StoreError>>>>,
    calls: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl std::fmt::Debug for MockClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterStore").finish_non_exhaustive()
    }
}

impl MockClusterStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error returned by the next call to `op` (e.g. `"create_secret"`).
    pub fn fail_next(&self, op: &'static str, err: StoreError) {
        lock(&self.faults).entry(op).or_default().push_back(err);
    }

    /// Number of times `op` has been called
    #[must_use]
    pub fn calls(&self, op: &str) -> usize {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }

    /// Insert or overwrite an object directly, bypassing conflict checks
    pub fn seed<T: Seed>(&self, obj: T) -> T {
        obj.seed_into(self)
    }

    /// Current copy of an object, if any
    #[must_use]
    pub fn peek<T: Seed>(&self, name: &str) -> Option<T> {
        T::peek_from(self, name)
    }

    fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        match lock(&self.faults).get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn bump(&self) -> String {
        let mut version = lock(&self.next_version);
        *version += 1;
        version.to_string()
    }

    fn stamp<T: Resource>(&self, obj: &mut T) {
        let version = self.bump();
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        meta.resource_version = Some(version);
    }

    fn insert<T: Resource + Clone>(&self, objects: &Objects<T>, mut obj: T) -> T {
        self.stamp(&mut obj);
        lock(objects).insert(obj.name_any(), obj.clone());
        obj
    }

    fn get_in<T: Clone>(objects: &Objects<T>, kind: &str, name: &str) -> Result<T, StoreError> {
        lock(objects)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{kind}/{name}")))
    }

    fn create_in<T: Resource + Clone>(
        &self,
        objects: &Objects<T>,
        kind: &str,
        obj: &T,
    ) -> Result<T, StoreError> {
        let name = obj.name_any();
        if lock(objects).contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("{kind}/{name}")));
        }
        let mut created = obj.clone();
        created.meta_mut().uid = None;
        Ok(self.insert(objects, created))
    }

    /// Applies `merge(stored, incoming)` if the incoming resource version is
    /// current (or unset).
    fn update_in<T, F>(
        &self,
        objects: &Objects<T>,
        kind: &str,
        obj: &T,
        merge: F,
    ) -> Result<T, StoreError>
    where
        T: Resource + Clone,
        F: FnOnce(&mut T, &T),
    {
        let name = obj.name_any();
        let mut map = lock(objects);
        let stored = map
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(format!("{kind}/{name}")))?;
        let incoming = obj.meta().resource_version.as_ref();
        if incoming.is_some() && stored.meta().resource_version.as_ref() != incoming {
            return Err(StoreError::Conflict(format!("{kind}/{name}")));
        }
        merge(stored, obj);
        stored.meta_mut().resource_version = Some(self.bump());
        Ok(stored.clone())
    }

    fn delete_in<T>(objects: &Objects<T>, kind: &str, name: &str) -> Result<(), StoreError> {
        lock(objects)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{kind}/{name}")))
    }
}

fn replace_all<T: Resource + Clone>(stored: &mut T, incoming: &T) {
    let uid = stored.meta().uid.clone();
    *stored = incoming.clone();
    stored.meta_mut().uid = uid;
}

/// Object kinds that can be seeded into and read back from the mock.
pub trait Seed: Sized {
    fn seed_into(self, store: &MockClusterStore) -> Self;
    fn peek_from(store: &MockClusterStore, name: &str) -> Option<Self>;
}

macro_rules! seedable {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(
            impl Seed for $ty {
                fn seed_into(self, store: &MockClusterStore) -> Self {
                    store.insert(&store.$field, self)
                }

                fn peek_from(store: &MockClusterStore, name: &str) -> Option<Self> {
                    lock(&store.$field).get(name).cloned()
                }
            }
        )*
    };
}

seedable!(
    BuildConfiguration => configs,
    BuildRecord => records,
    NodePool => pools,
    RenderedConfig => rendered,
    Secret => secrets,
    ConfigMap => config_maps,
    Pod => pods,
);

#[async_trait::async_trait]
impl ClusterStore for MockClusterStore {
    async fn get_build_configuration(&self, name: &str) -> Result<BuildConfiguration, StoreError> {
        self.enter("get_build_configuration")?;
        Self::get_in(&self.configs, "buildconfiguration", name)
    }

    async fn list_build_configurations(&self) -> Result<Vec<BuildConfiguration>, StoreError> {
        self.enter("list_build_configurations")?;
        Ok(lock(&self.configs).values().cloned().collect())
    }

    async fn update_build_configuration(
        &self,
        config: &BuildConfiguration,
    ) -> Result<BuildConfiguration, StoreError> {
        self.enter("update_build_configuration")?;
        self.update_in(&self.configs, "buildconfiguration", config, |stored, incoming| {
            stored.spec = incoming.spec.clone();
            stored.metadata.labels.clone_from(&incoming.metadata.labels);
            stored.metadata.annotations.clone_from(&incoming.metadata.annotations);
        })
    }

    async fn update_build_configuration_status(
        &self,
        config: &BuildConfiguration,
    ) -> Result<BuildConfiguration, StoreError> {
        self.enter("update_build_configuration_status")?;
        self.update_in(&self.configs, "buildconfiguration", config, |stored, incoming| {
            stored.status.clone_from(&incoming.status);
        })
    }

    async fn get_build_record(&self, name: &str) -> Result<BuildRecord, StoreError> {
        self.enter("get_build_record")?;
        Self::get_in(&self.records, "buildrecord", name)
    }

    async fn list_build_records(&self) -> Result<Vec<BuildRecord>, StoreError> {
        self.enter("list_build_records")?;
        Ok(lock(&self.records).values().cloned().collect())
    }

    async fn create_build_record(&self, record: &BuildRecord) -> Result<BuildRecord, StoreError> {
        self.enter("create_build_record")?;
        self.create_in(&self.records, "buildrecord", record)
    }

    async fn update_build_record_status(
        &self,
        record: &BuildRecord,
    ) -> Result<BuildRecord, StoreError> {
        self.enter("update_build_record_status")?;
        self.update_in(&self.records, "buildrecord", record, |stored, incoming| {
            stored.status.clone_from(&incoming.status);
        })
    }

    async fn delete_build_record(&self, name: &str) -> Result<(), StoreError> {
        self.enter("delete_build_record")?;
        Self::delete_in(&self.records, "buildrecord", name)
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError> {
        self.enter("get_node_pool")?;
        Self::get_in(&self.pools, "nodepool", name)
    }

    async fn update_node_pool(&self, pool: &NodePool) -> Result<NodePool, StoreError> {
        self.enter("update_node_pool")?;
        self.update_in(&self.pools, "nodepool", pool, replace_all)
    }

    async fn get_rendered_config(&self, name: &str) -> Result<RenderedConfig, StoreError> {
        self.enter("get_rendered_config")?;
        Self::get_in(&self.rendered, "renderedconfig", name)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, StoreError> {
        self.enter("get_secret")?;
        Self::get_in(&self.secrets, "secret", name)
    }

    async fn list_secrets(&self, label_selector: &str) -> Result<Vec<Secret>, StoreError> {
        self.enter("list_secrets")?;
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        Ok(lock(&self.secrets)
            .values()
            .filter(|secret| {
                let labels = secret.labels();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).is_some_and(|actual| actual == v))
            })
            .cloned()
            .collect())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.enter("create_secret")?;
        self.create_in(&self.secrets, "secret", secret)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.enter("update_secret")?;
        self.update_in(&self.secrets, "secret", secret, replace_all)
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, StoreError> {
        self.enter("get_config_map")?;
        Self::get_in(&self.config_maps, "configmap", name)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.enter("create_config_map")?;
        self.create_in(&self.config_maps, "configmap", config_map)
    }

    async fn delete_config_map(&self, name: &str) -> Result<(), StoreError> {
        self.enter("delete_config_map")?;
        Self::delete_in(&self.config_maps, "configmap", name)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, StoreError> {
        self.enter("get_pod")?;
        Self::get_in(&self.pods, "pod", name)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.enter("create_pod")?;
        self.create_in(&self.pods, "pod", pod)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), StoreError> {
        self.enter("delete_pod")?;
        Self::delete_in(&self.pods, "pod", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MockClusterStore::new();
        let created = store.create_secret(&secret("push")).await.unwrap();

        let first = store.update_secret(&created).await.unwrap();
        assert_ne!(first.metadata.resource_version, created.metadata.resource_version);

        let err = store.update_secret(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_existing_fails_and_faults_are_consumed() {
        let store = MockClusterStore::new();
        store.create_secret(&secret("push")).await.unwrap();
        assert!(store.create_secret(&secret("push")).await.unwrap_err().is_already_exists());

        store.fail_next("get_secret", StoreError::Other("boom".into()));
        assert!(store.get_secret("push").await.is_err());
        assert!(store.get_secret("push").await.is_ok());
        assert_eq!(store.calls("get_secret"), 2);
    }
}
