//! Event router.
//!
//! Watches configurations, records, pools and build pods. Watch events are
//! diffed against the last seen copy of each object, and every resulting
//! change is translated into work-queue keys. Pod changes go straight to the
//! [`PodWatcher`]. Configurations, records and pools are also reflected into
//! local caches that routing decisions read from.

use crate::builder::pod::BUILD_POD_LABEL;
use crate::error::ControllerError;
use crate::pod_watcher::PodWatcher;
use crate::reconciler::pool::{pool_change, PoolChange};
use crate::reconciler::Reconciler;
use crate::request::{build_record_name, owner_name};
use crate::secrets::canonical_name;
use crate::workqueue::{QueueKey, WorkQueue};
use crds::{BuildConfiguration, BuildInputs, BuildRecord, NodePool, SecretReference};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::{self, store::Writer, Store};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A change to one object, derived from watch events.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(K),
}

/// Remembers the last seen copy of every object of one kind.
///
/// Relists (`Init` .. `InitDone`) report objects missing from the new list
/// as deleted and skip objects whose resource version did not move.
#[derive(Debug)]
pub struct SnapshotTracker<K> {
    known: HashMap<String, K>,
    relisted: Option<HashSet<String>>,
}

impl<K> Default for SnapshotTracker<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K: Resource + Clone> SnapshotTracker<K> {
    fn applied(&mut self, obj: K) -> Option<Change<K>> {
        let name = obj.name_any();
        match self.known.insert(name, obj.clone()) {
            None => Some(Change::Added(obj)),
            Some(old) if old.meta().resource_version.is_some()
                && old.meta().resource_version == obj.meta().resource_version =>
            {
                None
            }
            Some(old) => Some(Change::Updated { old, new: obj }),
        }
    }

    pub fn apply(&mut self, event: watcher::Event<K>) -> Vec<Change<K>> {
        match event {
            watcher::Event::Apply(obj) => self.applied(obj).into_iter().collect(),
            watcher::Event::Delete(obj) => {
                self.known.remove(&obj.name_any());
                vec![Change::Deleted(obj)]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(obj.name_any());
                }
                self.applied(obj).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|name| !relisted.contains(*name))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|name| self.known.remove(&name))
                    .map(Change::Deleted)
                    .collect()
            }
        }
    }
}

fn same_secret(old: &SecretReference, new: &SecretReference) -> bool {
    old == new || new.name == canonical_name(&old.name)
}

/// Whether two sets of build inputs call for different images.
///
/// Pointing a secret reference at its canonical copy is not a change.
#[must_use]
pub fn inputs_changed(old: &BuildInputs, new: &BuildInputs) -> bool {
    let pull_same = match (&old.base_image_pull_secret, &new.base_image_pull_secret) {
        (Some(old), Some(new)) => same_secret(old, new),
        (None, None) => true,
        _ => false,
    };
    let mut normalized = new.clone();
    normalized
        .rendered_image_push_secret
        .clone_from(&old.rendered_image_push_secret);
    normalized
        .base_image_pull_secret
        .clone_from(&old.base_image_pull_secret);

    !(same_secret(&old.rendered_image_push_secret, &new.rendered_image_push_secret)
        && pull_same
        && normalized == *old)
}

/// Keys for a configuration change, plus whether it needs a rebuild.
#[must_use]
pub fn configuration_keys(
    change: &Change<BuildConfiguration>,
    records: &[BuildRecord],
) -> (Vec<QueueKey>, bool) {
    match change {
        Change::Added(config) => (vec![QueueKey::Build(config.name_any())], false),
        Change::Updated { old, new } => {
            let changed = old.spec.pool != new.spec.pool
                || inputs_changed(&old.spec.build_inputs, &new.spec.build_inputs);
            if changed {
                (vec![QueueKey::Build(new.name_any())], true)
            } else {
                (Vec::new(), false)
            }
        }
        Change::Deleted(config) => {
            let name = config.name_any();
            let keys = records
                .iter()
                .filter(|record| owner_name(record) == name)
                .map(|record| QueueKey::Build(record.name_any()))
                .collect();
            (keys, false)
        }
    }
}

/// Keys for a record change. Deleted records need no work.
#[must_use]
pub fn record_keys(change: &Change<BuildRecord>) -> Vec<QueueKey> {
    match change {
        Change::Added(record) | Change::Updated { new: record, .. } => {
            vec![QueueKey::Build(record.name_any())]
        }
        Change::Deleted(_) => Vec::new(),
    }
}

/// Keys for a pool change.
#[must_use]
pub fn pool_keys(
    change: &Change<NodePool>,
    configs: &[BuildConfiguration],
    records: &[BuildRecord],
) -> Vec<QueueKey> {
    let (old, current) = match change {
        Change::Added(pool) => (None, pool),
        Change::Updated { old, new } => (Some(old), new),
        Change::Deleted(pool) => {
            return if pool.layering_enabled() {
                vec![QueueKey::PoolOptOut(pool.name_any())]
            } else {
                Vec::new()
            };
        }
    };
    let name = current.name_any();
    let has_config = configs
        .iter()
        .any(|config| config.spec.pool.name == name);
    let record_name = build_record_name(&name, &current.spec.configuration.name);
    let record = records
        .iter()
        .find(|record| record.name_any() == record_name);

    match pool_change(old, current, has_config, record) {
        PoolChange::OptOut => vec![QueueKey::PoolOptOut(name)],
        PoolChange::BuildDue => vec![QueueKey::PoolBuild(name)],
        PoolChange::UpToDate => Vec::new(),
    }
}

/// Read handles for the reflected caches
#[derive(Clone)]
pub struct Caches {
    pub configs: Store<BuildConfiguration>,
    pub records: Store<BuildRecord>,
    pub pools: Store<NodePool>,
}

/// Write halves of [`Caches`], consumed by the watch loops
pub struct CacheWriters {
    configs: Writer<BuildConfiguration>,
    records: Writer<BuildRecord>,
    pools: Writer<NodePool>,
}

impl Caches {
    #[must_use]
    pub fn new() -> (Self, CacheWriters) {
        let (configs, configs_writer) = reflector::store();
        let (records, records_writer) = reflector::store();
        let (pools, pools_writer) = reflector::store();
        (
            Self {
                configs,
                records,
                pools,
            },
            CacheWriters {
                configs: configs_writer,
                records: records_writer,
                pools: pools_writer,
            },
        )
    }

    /// Resolves once every cache has completed its first list.
    pub async fn wait_until_ready(&self) -> Result<(), ControllerError> {
        let watch_err = |e: reflector::store::WriterDropped| {
            ControllerError::Watch(format!("cache writer dropped before sync: {e}"))
        };
        self.configs.wait_until_ready().await.map_err(watch_err)?;
        self.records.wait_until_ready().await.map_err(watch_err)?;
        self.pools.wait_until_ready().await.map_err(watch_err)?;
        Ok(())
    }
}

/// Runs one reflected watch, passing each change to `handle`. Stream
/// errors are logged and the watch resumes with backoff.
async fn run_reflected<K, F>(
    api: Api<K>,
    writer: Writer<K>,
    mut handle: F,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    F: FnMut(Change<K>),
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    info!("Starting {} watcher", kind);
    let mut tracker = SnapshotTracker::default();
    let mut stream = Box::pin(
        watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer),
    );
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => tracker.apply(event).into_iter().for_each(&mut handle),
            Err(e) => warn!("{} watch error: {}", kind, e),
        }
    }
    Err(ControllerError::Watch(format!("{kind} watch stream ended")))
}

/// Routes cluster events to the queue and the pod watcher.
pub struct Watcher {
    client: Client,
    namespace: String,
    queue: Arc<WorkQueue<QueueKey>>,
    reconciler: Arc<Reconciler>,
    pod_watcher: PodWatcher,
    caches: Caches,
}

impl Watcher {
    #[must_use]
    pub fn new(
        client: Client,
        namespace: &str,
        queue: Arc<WorkQueue<QueueKey>>,
        reconciler: Arc<Reconciler>,
        caches: Caches,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            queue,
            pod_watcher: PodWatcher::new(Arc::clone(&reconciler)),
            reconciler,
            caches,
        }
    }

    fn enqueue(&self, keys: Vec<QueueKey>) {
        for key in keys {
            debug!("Enqueueing {}", key);
            self.queue.add(key);
        }
    }

    fn cached<K: Clone>(items: Vec<Arc<K>>) -> Vec<K> {
        items.iter().map(|item| item.as_ref().clone()).collect()
    }

    /// Watches BuildConfigurations.
    pub async fn watch_configurations(
        &self,
        writer: Writer<BuildConfiguration>,
    ) -> Result<(), ControllerError> {
        run_reflected(Api::all(self.client.clone()), writer, |change| {
            let records = Self::cached(self.caches.records.state());
            let (keys, rebuild) = configuration_keys(&change, &records);
            if rebuild {
                if let Change::Updated { new, .. } = &change {
                    info!("Build inputs of {} changed", new.name_any());
                    self.reconciler.request_rebuild(&new.name_any());
                }
            }
            self.enqueue(keys);
        })
        .await
    }

    /// Watches BuildRecords.
    pub async fn watch_records(&self, writer: Writer<BuildRecord>) -> Result<(), ControllerError> {
        run_reflected(Api::all(self.client.clone()), writer, |change| {
            if let Change::Deleted(record) = &change {
                debug!("BuildRecord {} deleted", record.name_any());
                self.reconciler.forget(&record.name_any());
            }
            self.enqueue(record_keys(&change));
        })
        .await
    }

    /// Watches NodePools.
    pub async fn watch_pools(&self, writer: Writer<NodePool>) -> Result<(), ControllerError> {
        run_reflected(Api::all(self.client.clone()), writer, |change| {
            let configs = Self::cached(self.caches.configs.state());
            let records = Self::cached(self.caches.records.state());
            self.enqueue(pool_keys(&change, &configs, &records));
        })
        .await
    }

    /// Watches build pods in the controller namespace.
    pub async fn watch_build_pods(&self) -> Result<(), ControllerError> {
        info!("Starting build pod watcher");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(&format!("{BUILD_POD_LABEL}=true"));
        let mut tracker = SnapshotTracker::default();
        let mut stream = Box::pin(watcher(api, config).default_backoff());

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("Pod watch error: {}", e);
                    continue;
                }
            };
            for change in tracker.apply(event) {
                let (pod, result) = match &change {
                    Change::Added(pod) | Change::Updated { new: pod, .. } => {
                        (pod, self.pod_watcher.on_update(pod).await)
                    }
                    Change::Deleted(pod) => (pod, self.pod_watcher.on_delete(pod).await),
                };
                if let Err(e) = result {
                    warn!("Failed to handle build pod {}: {}", pod.name_any(), e);
                }
            }
        }
        Err(ControllerError::Watch("pod watch stream ended".to_string()))
    }

    /// Runs every watch until one of them ends.
    pub async fn run(&self, writers: CacheWriters) -> Result<(), ControllerError> {
        let CacheWriters {
            configs,
            records,
            pools,
        } = writers;
        tokio::select! {
            result = self.watch_configurations(configs) => result,
            result = self.watch_records(records) => result,
            result = self.watch_pools(pools) => result,
            result = self.watch_build_pods() => result,
        }
    }
}
