//! Builder observations.
//!
//! Backends and the pod watcher report what they see about builder objects.
//! Reports are parked per builder object and applied by a worker through an
//! `Observe` queue key, so a failed apply is retried like any other sync.
//! Observations from objects that are not the record's current builder are
//! dropped, so a deleted or replaced object cannot move a newer attempt.

use super::{lock, Reconciler};
use crate::builder::{BuildObservation, BuildObserver, ObservedBuildState};
use crate::cleanup::cleanup;
use crate::error::ControllerError;
use crate::lifecycle::BuildPhase;
use crate::request::{build_record_name, ArtifactNames};
use crate::store::optional;
use crate::workqueue::QueueKey;
use crds::{BuildConfiguration, BuildRecord, BuilderReference, ImageBuilderKind};
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// A report waiting for a worker.
#[derive(Debug, Clone)]
pub(crate) enum PendingObservation {
    Phase(BuildObservation),
    Evicted(BuildObservation),
}

impl PendingObservation {
    fn observation(&self) -> &BuildObservation {
        match self {
            Self::Phase(observation) | Self::Evicted(observation) => observation,
        }
    }
}

/// Whether `observation` is about the builder object the record points at.
fn is_current_builder(record: &BuildRecord, observation: &BuildObservation) -> bool {
    let reference = record
        .status
        .as_ref()
        .and_then(|status| status.builder_reference.as_ref());
    let Some(reference) = reference else {
        return observation.object_name == ArtifactNames::for_record(record).build;
    };
    if reference.name != observation.object_name {
        return false;
    }
    match (&reference.uid, &observation.uid) {
        (Some(expected), Some(seen)) => expected == seen,
        _ => true,
    }
}

impl Reconciler {
    /// Parks `pending` and queues its builder object. A newer report for the
    /// same object replaces an unapplied older one.
    fn defer(&self, pending: PendingObservation) {
        let key = pending.observation().object_name.clone();
        lock(&self.observations).insert(key.clone(), pending);
        self.ctx.queue.add(QueueKey::Observe(key));
    }

    /// Queues a reschedule for an evicted builder object.
    pub fn report_eviction(&self, observation: BuildObservation) {
        self.defer(PendingObservation::Evicted(observation));
    }

    /// Applies the parked report for `object_name`.
    ///
    /// On a retryable failure the report is parked again unless a newer one
    /// arrived in the meantime.
    pub(crate) async fn process_observation(
        &self,
        object_name: &str,
    ) -> Result<(), ControllerError> {
        let Some(pending) = lock(&self.observations).remove(object_name) else {
            debug!("No pending observation for {}", object_name);
            return Ok(());
        };
        let result = match &pending {
            PendingObservation::Phase(observation) => self.apply_observation(observation).await,
            PendingObservation::Evicted(observation) => self.reschedule(observation).await,
        };
        if let Err(e) = &result {
            if e.is_retryable() {
                lock(&self.observations)
                    .entry(object_name.to_string())
                    .or_insert(pending);
            }
        }
        result
    }

    /// Resolves the configuration and record an observation is about.
    async fn resolve(
        &self,
        observation: &BuildObservation,
    ) -> Result<Option<(BuildConfiguration, BuildRecord)>, ControllerError> {
        let Some(config) = self.config_for_pool(&observation.pool).await? else {
            debug!("No BuildConfiguration targets pool {}", observation.pool);
            return Ok(None);
        };
        let record_name = match &observation.record {
            Some(record) => record.clone(),
            None => {
                let pool = self.ctx.store.get_node_pool(&observation.pool).await?;
                build_record_name(&observation.pool, &pool.spec.configuration.name)
            }
        };
        let Some(record) = optional(self.ctx.store.get_build_record(&record_name).await)? else {
            debug!("BuildRecord {} for {} is gone", record_name, observation.object_name);
            return Ok(None);
        };
        if !is_current_builder(&record, observation) {
            debug!(
                "Ignoring {} which is not the current builder of {}",
                observation.object_name, record_name
            );
            return Ok(None);
        }
        Ok(Some((config, record)))
    }

    async fn apply_observation(
        &self,
        observation: &BuildObservation,
    ) -> Result<(), ControllerError> {
        let Some((config, record)) = self.resolve(observation).await? else {
            return Ok(());
        };
        let name = record.name_any();
        let phase = BuildPhase::from_status(record.status.as_ref());

        match (observation.state, phase) {
            (ObservedBuildState::Pending, BuildPhase::Pending) => {
                self.adopt(&record, &config, observation, BuildPhase::Prepared)
                    .await?;
            }
            (ObservedBuildState::Running, BuildPhase::Pending | BuildPhase::Prepared) => {
                self.adopt(&record, &config, observation, BuildPhase::Building)
                    .await?;
            }
            (ObservedBuildState::Succeeded, p) if p.is_active() => {
                let reported = observation.digest.as_deref();
                match self.mark_succeeded(&record, &config, reported).await {
                    Err(ControllerError::Validation(message)) => {
                        warn!("Build {} produced an unusable result: {}", name, message);
                        self.transition(&name, BuildPhase::Failed, |_| {}).await?;
                    }
                    other => other?,
                }
            }
            (ObservedBuildState::Failed, p) if p.is_active() || p == BuildPhase::Pending => {
                info!("Build {} failed", name);
                self.transition(&name, BuildPhase::Failed, |_| {}).await?;
            }
            (state, phase) => {
                debug!("Observed {:?} for {} while {}, nothing to do", state, name, phase);
            }
        }
        Ok(())
    }

    /// Moves a record whose builder is alive to `next`.
    ///
    /// A start that failed after creating the builder object leaves the
    /// record without a reference and the pool without the source. Both are
    /// filled in here from the observation.
    async fn adopt(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
        observation: &BuildObservation,
        next: BuildPhase,
    ) -> Result<(), ControllerError> {
        let name = record.name_any();
        let reference = match record
            .status
            .as_ref()
            .and_then(|status| status.builder_reference.clone())
        {
            Some(reference) => reference,
            None => {
                info!("Adopting builder {} for {}", observation.object_name, name);
                self.observed_reference(observation)
            }
        };
        self.append_pool_source(&config.spec.pool.name, &reference)
            .await?;
        let started = chrono::Utc::now();
        self.transition(&name, next, |status| {
            if status.builder_reference.is_none() {
                status.builder_reference = Some(reference.clone());
            }
            if status.build_start.is_none() {
                status.build_start = Some(started);
            }
        })
        .await?;
        lock(&self.started)
            .entry(name)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    fn observed_reference(&self, observation: &BuildObservation) -> BuilderReference {
        let image_builder_type = self.ctx.builder.kind();
        let kind = match image_builder_type {
            ImageBuilderKind::PodImageBuilder => "Pod",
            ImageBuilderKind::NativeImageBuilder => "Build",
        };
        BuilderReference {
            image_builder_type,
            kind: kind.to_string(),
            name: observation.object_name.clone(),
            namespace: self.ctx.config.namespace.clone(),
            uid: observation.uid.clone(),
        }
    }

    /// Starts a fresh attempt after the record's builder was evicted.
    ///
    /// The record is not failed; terminal records and builds that are still
    /// running are left alone.
    pub async fn reschedule(&self, observation: &BuildObservation) -> Result<(), ControllerError> {
        let Some((config, record)) = self.resolve(observation).await? else {
            return Ok(());
        };
        let name = record.name_any();
        let phase = BuildPhase::from_status(record.status.as_ref());
        if phase.is_terminal() {
            debug!("Record {} is {}, not rescheduling", name, phase);
            return Ok(());
        }
        if self.ctx.builder.is_build_running(&record, &config).await? {
            debug!("Build for {} is still running, not rescheduling", name);
            return Ok(());
        }
        info!("Rescheduling evicted build {} for {}", observation.object_name, name);
        cleanup(&*self.ctx.store, &*self.ctx.builder, &record, &config, true).await?;
        self.forget(&name);
        self.start_build(&record).await
    }
}

#[async_trait::async_trait]
impl BuildObserver for Reconciler {
    async fn observe(&self, observation: BuildObservation) -> Result<(), ControllerError> {
        self.defer(PendingObservation::Phase(observation));
        Ok(())
    }
}
