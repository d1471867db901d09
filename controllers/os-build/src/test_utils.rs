//! Test utilities for unit testing the reconciler
//!
//! Builders for test objects and a fixture wiring a [`Reconciler`] to the
//! in-memory store and backend.

use crate::assembler::{
    BASE_IMAGE_KEY, CONTROLLER_IMAGES_CONFIG_MAP, EXTENSIONS_IMAGE_KEY, IMAGES_KEY,
    OS_IMAGE_DEFAULTS_CONFIG_MAP, RELEASE_VERSION_KEY,
};
use crate::builder::{BuildObservation, BuildObserver, MockImageBuilder};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{Context, Reconciler};
use crate::request::{build_record_name, RENDERED_CONFIG_LABEL, TARGET_POOL_LABEL};
use crate::store::MockClusterStore;
use crate::workqueue::{QueueKey, WorkQueue};
use crds::*;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TEST_NAMESPACE: &str = "os-build";
pub const TEST_BASE_IMAGE: &str = "quay.io/os/base@sha256:1111111111111111111111111111111111111111111111111111111111111111";
pub const TEST_EXTENSIONS_IMAGE: &str = "quay.io/os/extensions:4.16";
pub const TEST_RELEASE_VERSION: &str = "4.16";
pub const TEST_MCO_IMAGE: &str = "quay.io/os/machine-config-operator:4.16";
pub const TEST_PUSHSPEC: &str = "registry.example.com/os/worker:latest";
pub const TEST_PUSH_SECRET: &str = "push-secret";
pub const TEST_RENDERED_CONTENT: &str = r#"{"kind":"MachineConfig","spec":{"config":{}}}"#;
pub const TEST_DIGEST: &str =
    "sha256:abcdefabcdefabcdefabcdefabcdefabcdefabcdefabcdefabcdefabcdefabcd";

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn namespaced_meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(TEST_NAMESPACE.to_string()),
        ..meta(name)
    }
}

/// Helper to create a test BuildConfiguration leaving image inputs to the defaults
pub fn create_test_build_configuration(name: &str, pool: &str) -> BuildConfiguration {
    BuildConfiguration {
        metadata: meta(name),
        spec: BuildConfigurationSpec {
            pool: PoolReference {
                name: pool.to_string(),
            },
            build_inputs: BuildInputs {
                rendered_image_push_secret: SecretReference {
                    name: TEST_PUSH_SECRET.to_string(),
                },
                rendered_image_pushspec: TEST_PUSHSPEC.to_string(),
                ..Default::default()
            },
        },
        status: None,
    }
}

/// Helper to create a test NodePool
pub fn create_test_node_pool(name: &str, rendered: &str, layered: bool) -> NodePool {
    let mut metadata = meta(name);
    if layered {
        metadata.labels = Some(BTreeMap::from([(
            LAYERING_ENABLED_LABEL.to_string(),
            "true".to_string(),
        )]));
    }
    NodePool {
        metadata,
        spec: NodePoolSpec {
            configuration: PoolConfiguration {
                name: rendered.to_string(),
                source: Vec::new(),
            },
        },
    }
}

/// Helper to create a BuildRecord for `config` as the reconciler would
pub fn create_test_build_record(config: &BuildConfiguration, rendered: &str) -> BuildRecord {
    let pool = &config.spec.pool.name;
    let pushspec = TEST_PUSHSPEC.replace(":latest", &format!(":{rendered}"));
    let mut metadata = meta(&build_record_name(pool, rendered));
    metadata.labels = Some(BTreeMap::from([
        (TARGET_POOL_LABEL.to_string(), pool.clone()),
        (RENDERED_CONFIG_LABEL.to_string(), rendered.to_string()),
    ]));
    BuildRecord {
        metadata,
        spec: BuildRecordSpec {
            build_configuration: ObjectName {
                name: config.metadata.name.clone().unwrap_or_default(),
            },
            desired_config: ObjectName {
                name: rendered.to_string(),
            },
            rendered_image_pushspec: pushspec,
        },
        status: None,
    }
}

/// Helper to create a test RenderedConfig
pub fn create_test_rendered_config(name: &str) -> RenderedConfig {
    RenderedConfig {
        metadata: meta(name),
        spec: RenderedConfigSpec {
            content: TEST_RENDERED_CONTENT.to_string(),
        },
    }
}

/// Helper to create a test Secret of the given type with one key
pub fn create_test_secret(name: &str, type_: &str) -> Secret {
    Secret {
        metadata: namespaced_meta(name),
        type_: Some(type_.to_string()),
        data: Some(BTreeMap::from([(
            "key".to_string(),
            ByteString(b"value".to_vec()),
        )])),
        ..Default::default()
    }
}

/// Helper to create a push secret already in canonical form
pub fn create_test_push_secret(name: &str) -> Secret {
    Secret {
        metadata: namespaced_meta(name),
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(br#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#.to_vec()),
        )])),
        ..Default::default()
    }
}

/// Helper to create a push secret in the legacy `.dockercfg` form
pub fn create_test_legacy_push_secret(name: &str) -> Secret {
    Secret {
        metadata: namespaced_meta(name),
        type_: Some("kubernetes.io/dockercfg".to_string()),
        data: Some(BTreeMap::from([(
            ".dockercfg".to_string(),
            ByteString(br#"{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}"#.to_vec()),
        )])),
        ..Default::default()
    }
}

/// Helper to create a test ConfigMap
pub fn create_test_config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: namespaced_meta(name),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Helper to create a pod builder reference
pub fn create_test_builder_reference(name: &str, uid: Option<&str>) -> BuilderReference {
    BuilderReference {
        image_builder_type: ImageBuilderKind::PodImageBuilder,
        kind: "Pod".to_string(),
        name: name.to_string(),
        namespace: TEST_NAMESPACE.to_string(),
        uid: uid.map(str::to_string),
    }
}

/// Seeds a layered pool with everything a build needs and returns its
/// configuration, named `<pool>-build`.
pub fn seed_layered_pool(store: &MockClusterStore, pool: &str, rendered: &str) -> BuildConfiguration {
    store.seed(create_test_node_pool(pool, rendered, true));
    store.seed(create_test_rendered_config(rendered));
    store.seed(create_test_push_secret(TEST_PUSH_SECRET));
    store.seed(create_test_config_map(
        OS_IMAGE_DEFAULTS_CONFIG_MAP,
        &[
            (BASE_IMAGE_KEY, TEST_BASE_IMAGE),
            (EXTENSIONS_IMAGE_KEY, TEST_EXTENSIONS_IMAGE),
            (RELEASE_VERSION_KEY, TEST_RELEASE_VERSION),
        ],
    ));
    let images = format!(r#"{{"machineConfigOperator":"{TEST_MCO_IMAGE}"}}"#);
    store.seed(create_test_config_map(
        CONTROLLER_IMAGES_CONFIG_MAP,
        &[(IMAGES_KEY, images.as_str())],
    ));
    store.seed(create_test_build_configuration(&format!("{pool}-build"), pool))
}

/// Reconciler wired to in-memory collaborators
pub struct TestFixture {
    pub store: MockClusterStore,
    pub builder: MockImageBuilder,
    pub queue: Arc<WorkQueue<QueueKey>>,
    pub reconciler: Arc<Reconciler>,
}

/// Helper to create a reconciler over a fresh mock store and backend
pub fn create_test_fixture() -> TestFixture {
    let store = MockClusterStore::new();
    let builder = MockImageBuilder::new();
    let config = ControllerConfig {
        namespace: TEST_NAMESPACE.to_string(),
        ..Default::default()
    };
    let queue = WorkQueue::new(config.item_backoff);
    let reconciler = Arc::new(Reconciler::new(Context {
        store: Arc::new(store.clone()),
        builder: Arc::new(builder.clone()),
        queue: Arc::clone(&queue),
        config,
        metrics: Arc::new(Metrics::new().unwrap()),
    }));
    TestFixture {
        store,
        builder,
        queue,
        reconciler,
    }
}

/// Current lifecycle phase of a stored record
pub fn record_phase(store: &MockClusterStore, name: &str) -> crate::lifecycle::BuildPhase {
    let record: BuildRecord = store.peek(name).unwrap();
    crate::lifecycle::BuildPhase::from_status(record.status.as_ref())
}

/// Seeds a layered pool, reconciles its configuration and returns the
/// record of the started build.
pub async fn start_test_build(fixture: &TestFixture, pool: &str, rendered: &str) -> BuildRecord {
    let config = seed_layered_pool(&fixture.store, pool, rendered);
    fixture
        .reconciler
        .sync(&QueueKey::Build(config.metadata.name.clone().unwrap()))
        .await
        .unwrap();
    fixture.store.peek(&build_record_name(pool, rendered)).unwrap()
}

/// Applies every queued observation, dropping other queued keys.
pub async fn process_observations(fixture: &TestFixture) -> Result<(), ControllerError> {
    while !fixture.queue.is_empty() {
        let Some(key) = fixture.queue.get().await else {
            break;
        };
        let result = if matches!(key, QueueKey::Observe(_)) {
            fixture.reconciler.sync(&key).await
        } else {
            Ok(())
        };
        fixture.queue.done(&key);
        result?;
    }
    Ok(())
}

/// Reports `observation` and applies it the way a worker would.
pub async fn deliver(
    fixture: &TestFixture,
    observation: BuildObservation,
) -> Result<(), ControllerError> {
    fixture.reconciler.observe(observation).await?;
    process_observations(fixture).await
}
