//! Unit tests for builder observations and eviction rescheduling

use crate::builder::{BuildObservation, ObservedBuildState};
use crate::controller::handle_err;
use crate::lifecycle::BuildPhase;
use crate::request::{ArtifactNames, DIGEST_KEY};
use crate::store::StoreError;
use crate::test_utils::*;
use crate::workqueue::QueueKey;
use crds::{BuildConfiguration, BuildRecord, NodePool};
use k8s_openapi::api::core::v1::ConfigMap;
use std::time::Duration;

const RECORD: &str = "worker-rendered-worker-1-builder";

fn observation(record: &BuildRecord, state: ObservedBuildState) -> BuildObservation {
    let reference = record
        .status
        .as_ref()
        .and_then(|status| status.builder_reference.clone())
        .unwrap();
    BuildObservation {
        pool: "worker".to_string(),
        record: Some(record.metadata.name.clone().unwrap()),
        object_name: reference.name,
        uid: reference.uid,
        state,
        digest: None,
    }
}

fn seed_digest(fx: &TestFixture, digest: &str) {
    let names = ArtifactNames::for_rendered_config("rendered-worker-1");
    fx.store
        .seed(create_test_config_map(&names.digest, &[(DIGEST_KEY, digest)]));
}

#[tokio::test]
async fn test_running_observation_moves_to_building() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;

    deliver(&fx, observation(&record, ObservedBuildState::Running)).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Building);
}

#[tokio::test]
async fn test_failed_observation_fails_record() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;

    deliver(&fx, observation(&record, ObservedBuildState::Failed)).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Failed);
    let record: BuildRecord = fx.store.peek(RECORD).unwrap();
    assert!(record.status.unwrap().build_end.is_some());
}

#[tokio::test]
async fn test_succeeded_observation_publishes_digested_pullspec() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    seed_digest(&fx, TEST_DIGEST);

    deliver(&fx, observation(&record, ObservedBuildState::Succeeded)).await.unwrap();

    let expected = format!("registry.example.com/os/worker@{TEST_DIGEST}");
    let config: BuildConfiguration = fx.store.peek("worker-build").unwrap();
    assert_eq!(
        config.status.unwrap().current_image_pullspec.as_deref(),
        Some(expected.as_str())
    );
    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Succeeded);
    let record: BuildRecord = fx.store.peek(RECORD).unwrap();
    assert_eq!(
        record.status.unwrap().final_image_pushspec.as_deref(),
        Some(expected.as_str())
    );

    let names = ArtifactNames::for_rendered_config("rendered-worker-1");
    assert_eq!(fx.builder.deleted(), vec![names.build.clone()]);
    assert!(fx.store.peek::<ConfigMap>(&names.rendered_config).is_none());
    assert!(fx.store.peek::<ConfigMap>(&names.containerfile).is_none());
    assert!(fx.store.peek::<ConfigMap>(&names.digest).is_none());
}

#[tokio::test]
async fn test_redelivered_success_is_harmless() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    seed_digest(&fx, TEST_DIGEST);
    let success = observation(&record, ObservedBuildState::Succeeded);

    deliver(&fx, success.clone()).await.unwrap();
    deliver(&fx, success).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Succeeded);
}

#[tokio::test]
async fn test_malformed_digest_fails_record() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    seed_digest(&fx, "sha256:not-a-digest");

    deliver(&fx, observation(&record, ObservedBuildState::Succeeded)).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Failed);
    let config: BuildConfiguration = fx.store.peek("worker-build").unwrap();
    assert!(config.status.is_none());
}

#[tokio::test]
async fn test_observation_from_replaced_builder_is_ignored() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    let mut stale = observation(&record, ObservedBuildState::Failed);
    stale.uid = Some("uid-of-an-older-pod".to_string());

    deliver(&fx, stale).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Prepared);
}

#[tokio::test]
async fn test_observation_for_unknown_pool_is_ignored() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    let mut other = observation(&record, ObservedBuildState::Failed);
    other.pool = "infra".to_string();

    deliver(&fx, other).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Prepared);
}

#[tokio::test]
async fn test_reschedule_after_eviction_starts_again_without_failing() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    let evicted = observation(&record, ObservedBuildState::Failed);
    deliver(&fx, observation(&record, ObservedBuildState::Running)).await.unwrap();
    fx.builder.set_running("build-rendered-worker-1", false);

    fx.reconciler.reschedule(&evicted).await.unwrap();

    assert_eq!(fx.builder.started().len(), 2);
    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Prepared);
    let record: BuildRecord = fx.store.peek(RECORD).unwrap();
    let reference = record.status.unwrap().builder_reference.unwrap();
    assert_ne!(reference.uid, evicted.uid);
}

#[tokio::test]
async fn test_reschedule_skips_terminal_record() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    let failed = observation(&record, ObservedBuildState::Failed);
    deliver(&fx, failed.clone()).await.unwrap();
    fx.builder.set_running("build-rendered-worker-1", false);

    fx.reconciler.reschedule(&failed).await.unwrap();

    assert_eq!(fx.builder.started().len(), 1);
    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Failed);
}

#[tokio::test]
async fn test_failed_apply_is_retried_from_the_queue() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    deliver(&fx, observation(&record, ObservedBuildState::Running))
        .await
        .unwrap();
    seed_digest(&fx, TEST_DIGEST);
    fx.store.fail_next(
        "get_config_map",
        StoreError::Other("etcdserver: request timed out".to_string()),
    );

    let result = deliver(&fx, observation(&record, ObservedBuildState::Succeeded)).await;

    assert!(result.is_err());
    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Building);

    let key = QueueKey::Observe("build-rendered-worker-1".to_string());
    handle_err(&fx.queue, &key, result, 5, Duration::from_secs(60));
    assert_eq!(fx.queue.num_requeues(&key), 1);

    fx.reconciler.sync(&key).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Succeeded);
}

#[tokio::test]
async fn test_newer_report_replaces_unapplied_one() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    fx.store.fail_next(
        "get_build_record",
        StoreError::Other("connection reset".to_string()),
    );
    assert!(deliver(&fx, observation(&record, ObservedBuildState::Running))
        .await
        .is_err());

    deliver(&fx, observation(&record, ObservedBuildState::Failed))
        .await
        .unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Failed);
}

#[tokio::test]
async fn test_reported_digest_used_without_digest_config_map() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;
    let mut success = observation(&record, ObservedBuildState::Succeeded);
    success.digest = Some(TEST_DIGEST.to_string());

    deliver(&fx, success).await.unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Succeeded);
    let record: BuildRecord = fx.store.peek(RECORD).unwrap();
    assert_eq!(
        record.status.unwrap().final_image_pushspec,
        Some(format!("registry.example.com/os/worker@{TEST_DIGEST}"))
    );
}

#[tokio::test]
async fn test_success_without_any_digest_waits() {
    let fx = create_test_fixture();
    let record = start_test_build(&fx, "worker", "rendered-worker-1").await;

    let err = deliver(&fx, observation(&record, ObservedBuildState::Succeeded))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Prepared);
}

#[tokio::test]
async fn test_running_builder_adopted_after_interrupted_start() {
    let fx = create_test_fixture();
    let config = seed_layered_pool(&fx.store, "worker", "rendered-worker-1");
    fx.store.fail_next(
        "update_node_pool",
        StoreError::Other("etcdserver: leader changed".to_string()),
    );
    let key = QueueKey::Build(config.metadata.name.clone().unwrap());
    assert!(fx.reconciler.sync(&key).await.is_err());
    assert_eq!(fx.builder.started().len(), 1);
    let record: BuildRecord = fx.store.peek(RECORD).unwrap();
    assert!(record
        .status
        .as_ref()
        .and_then(|status| status.builder_reference.as_ref())
        .is_none());

    deliver(
        &fx,
        BuildObservation {
            pool: "worker".to_string(),
            record: Some(RECORD.to_string()),
            object_name: "build-rendered-worker-1".to_string(),
            uid: Some("mock-uid-1".to_string()),
            state: ObservedBuildState::Running,
            digest: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(record_phase(&fx.store, RECORD), BuildPhase::Building);
    let record: BuildRecord = fx.store.peek(RECORD).unwrap();
    let status = record.status.unwrap();
    let reference = status.builder_reference.unwrap();
    assert_eq!(reference.name, "build-rendered-worker-1");
    assert_eq!(reference.kind, "Pod");
    assert!(status.build_start.is_some());
    let pool: NodePool = fx.store.peek("worker").unwrap();
    assert!(pool
        .spec
        .configuration
        .source
        .iter()
        .any(|source| source.name == "build-rendered-worker-1"));
}
