//! Build pod monitoring.
//!
//! Pod phase alone is not trusted: a container stuck pulling its image or
//! exiting non-zero fails the build even while the pod still reads Running.
//! Evicted pods are not build failures; their build is started again.

use crate::builder::pod::BUILD_POD_LABEL;
use crate::builder::{BuildObservation, BuildObserver, ObservedBuildState};
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::request::{BUILD_RECORD_LABEL, TARGET_POOL_LABEL};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Waiting reasons that mean a container will never start
const CONTAINER_ERROR_REASONS: [&str; 2] = ["ErrImagePull", "CreateContainerError"];

const EVICTED_REASON: &str = "Evicted";

#[must_use]
pub fn is_build_pod(pod: &Pod) -> bool {
    pod.labels()
        .get(BUILD_POD_LABEL)
        .is_some_and(|value| value == "true")
}

/// First container-level error of the pod, if any.
#[must_use]
pub fn build_pod_error(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses.iter().find_map(|container| {
        let state = container.state.as_ref()?;
        if let Some(reason) = state
            .waiting
            .as_ref()
            .and_then(|waiting| waiting.reason.as_deref())
            .filter(|reason| CONTAINER_ERROR_REASONS.contains(reason))
        {
            return Some(format!("container {} is waiting: {reason}", container.name));
        }
        state
            .terminated
            .as_ref()
            .filter(|terminated| terminated.exit_code != 0)
            .map(|terminated| {
                format!(
                    "container {} exited with code {}",
                    container.name, terminated.exit_code
                )
            })
    })
}

/// Whether the pod was evicted, by pod reason or by condition reason.
#[must_use]
pub fn is_pod_evicted(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.reason.as_deref() == Some(EVICTED_REASON)
        || status.conditions.iter().flatten().any(|condition| {
            condition.reason.as_deref() == Some(EVICTED_REASON)
        })
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Maps a build pod onto an observation. Pods without a pool label or a
/// known phase yield nothing.
#[must_use]
pub fn observation_for(pod: &Pod) -> Option<BuildObservation> {
    let state = match pod_phase(pod)? {
        "Pending" => ObservedBuildState::Pending,
        "Running" => ObservedBuildState::Running,
        "Succeeded" => ObservedBuildState::Succeeded,
        "Failed" => ObservedBuildState::Failed,
        _ => return None,
    };
    let labels = pod.labels();
    Some(BuildObservation {
        pool: labels.get(TARGET_POOL_LABEL)?.clone(),
        record: labels.get(BUILD_RECORD_LABEL).cloned(),
        object_name: pod.name_any(),
        uid: pod.uid(),
        state,
        digest: None,
    })
}

/// Turns build pod events into queued reconciler work.
pub struct PodWatcher {
    reconciler: Arc<Reconciler>,
}

impl PodWatcher {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Handles a created or updated pod.
    pub async fn on_update(&self, pod: &Pod) -> Result<(), ControllerError> {
        if !is_build_pod(pod) {
            return Ok(());
        }
        let Some(mut observation) = observation_for(pod) else {
            debug!("Build pod {} has no usable phase or pool label", pod.name_any());
            return Ok(());
        };

        if observation.state == ObservedBuildState::Failed && is_pod_evicted(pod) {
            info!("Build pod {} was evicted, rescheduling", pod.name_any());
            self.reconciler.report_eviction(observation);
            return Ok(());
        }
        if let Some(error) = build_pod_error(pod) {
            info!("Build pod {} failed: {}", pod.name_any(), error);
            observation.state = ObservedBuildState::Failed;
        }
        self.reconciler.observe(observation).await
    }

    /// Handles a deleted pod. Only evictions matter.
    pub async fn on_delete(&self, pod: &Pod) -> Result<(), ControllerError> {
        if !is_build_pod(pod) || !is_pod_evicted(pod) {
            return Ok(());
        }
        let Some(observation) = observation_for(pod) else {
            return Ok(());
        };
        info!("Evicted build pod {} was deleted, rescheduling", pod.name_any());
        self.reconciler.report_eviction(observation);
        Ok(())
    }
}
