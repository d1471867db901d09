//! Reconciliation engine.
//!
//! Workers call [`Reconciler::sync`] with a [`QueueKey`]. A `Build` key names
//! either a BuildRecord or a BuildConfiguration and is resolved record-first.
//! Each call drives at most one lifecycle step; anything that has to happen
//! later is re-enqueued.
//!
//! - `transitions`: lifecycle writes (Prepared, Succeeded, generic transitions)
//! - `observe`: builder observations and eviction rescheduling
//! - `pool`: pool opt-out and pool-triggered builds

mod observe;
pub mod pool;
mod transitions;

#[cfg(test)]
mod observe_test;

use crate::assembler::BuildRequestAssembler;
use crate::builder::ImageBuilder;
use crate::cleanup::cleanup;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::image_ref::ImageReference;
use crate::lifecycle::BuildPhase;
use crate::metrics::Metrics;
use crate::request::{
    build_record_name, owner_name, ArtifactNames, RENDERED_CONFIG_LABEL, TARGET_POOL_LABEL,
};
use crate::secrets::SecretCanonicalizer;
use crate::store::{optional, ClusterStore};
use crate::workqueue::{QueueKey, WorkQueue};
use observe::PendingObservation;
use crds::{
    BuildConfiguration, BuildConfigurationSpec, BuildInputs, BuildRecord, BuildRecordSpec,
    NodePool, ObjectName, PoolReference,
};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collaborators shared by every component.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub builder: Arc<dyn ImageBuilder>,
    pub queue: Arc<WorkQueue<QueueKey>>,
    pub config: ControllerConfig,
    pub metrics: Arc<Metrics>,
}

/// Drives BuildRecords through their lifecycle.
pub struct Reconciler {
    ctx: Context,
    assembler: BuildRequestAssembler,
    secrets: SecretCanonicalizer,
    /// Record snapshot each running attempt was started from, by record name
    started: Mutex<HashMap<String, BuildRecord>>,
    /// Configurations whose build inputs changed since they were last handled
    rebuilds: Mutex<HashSet<String>>,
    /// Latest unapplied observation per builder object
    observations: Mutex<HashMap<String, PendingObservation>>,
}

impl Reconciler {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        let namespace = ctx.config.namespace.clone();
        Self {
            assembler: BuildRequestAssembler::new(Arc::clone(&ctx.store), &namespace),
            secrets: SecretCanonicalizer::new(
                Arc::clone(&ctx.store),
                &namespace,
                ctx.config.conflict_retry,
            ),
            ctx,
            started: Mutex::new(HashMap::new()),
            rebuilds: Mutex::new(HashSet::new()),
            observations: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Processes one queue key.
    pub async fn sync(&self, key: &QueueKey) -> Result<(), ControllerError> {
        let (kind, result) = match key {
            QueueKey::Build(name) => ("build", self.reconcile(name).await),
            QueueKey::PoolBuild(pool) => ("pool-build", self.reconcile_pool_build(pool).await),
            QueueKey::PoolOptOut(pool) => ("pool-opt-out", self.finalize_opt_out(pool).await),
            QueueKey::Observe(object) => ("observe", self.process_observation(object).await),
        };
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.ctx
            .metrics
            .reconciles
            .with_label_values(&[kind, outcome])
            .inc();
        result
    }

    /// Reconciles a record or configuration by name. Neither existing is a no-op.
    pub async fn reconcile(&self, name: &str) -> Result<(), ControllerError> {
        if let Some(record) = optional(self.ctx.store.get_build_record(name).await)? {
            return self.reconcile_record(record).await;
        }
        if let Some(config) = optional(self.ctx.store.get_build_configuration(name).await)? {
            return self.reconcile_configuration(config).await;
        }
        debug!("{} no longer exists, nothing to do", name);
        Ok(())
    }

    /// Marks `config` as having new build inputs.
    pub fn request_rebuild(&self, config: &str) {
        lock(&self.rebuilds).insert(config.to_string());
    }

    /// Drops the start snapshot of a deleted record.
    pub fn forget(&self, record: &str) {
        lock(&self.started).remove(record);
    }

    fn take_rebuild_request(&self, config: &str) -> bool {
        lock(&self.rebuilds).remove(config)
    }

    async fn reconcile_record(&self, record: BuildRecord) -> Result<(), ControllerError> {
        let name = record.name_any();
        let Some(config) =
            optional(self.ctx.store.get_build_configuration(owner_name(&record)).await)?
        else {
            info!(
                "BuildConfiguration {} of record {} is gone, tearing down",
                owner_name(&record),
                name
            );
            return self.teardown(&record, &orphan_owner(&record)).await;
        };

        match BuildPhase::from_status(record.status.as_ref()) {
            BuildPhase::Pending => {
                if self.should_build(&record, &config).await? {
                    self.start_build(&record).await
                } else {
                    Ok(())
                }
            }
            BuildPhase::Interrupted => self.restart_interrupted(&record, &config).await,
            phase @ (BuildPhase::Prepared
            | BuildPhase::Building
            | BuildPhase::Succeeded
            | BuildPhase::Failed) => {
                debug!("Record {} is {}, nothing to do", name, phase);
                Ok(())
            }
        }
    }

    /// Whether a Pending record needs a build started.
    ///
    /// A record whose desired configuration matches the snapshot its last
    /// build was started from does not. Otherwise a build is needed unless
    /// the backend already runs one.
    pub(crate) async fn should_build(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<bool, ControllerError> {
        let previous = lock(&self.started).get(&record.name_any()).cloned();
        if previous.is_some_and(|old| old.spec.desired_config == record.spec.desired_config) {
            debug!(
                "Desired config of {} unchanged since last start",
                record.name_any()
            );
            return Ok(false);
        }
        if self.ctx.builder.is_build_running(record, config).await? {
            info!(
                "Build for {} is already running, not starting another",
                record.name_any()
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn reconcile_configuration(
        &self,
        config: BuildConfiguration,
    ) -> Result<(), ControllerError> {
        let config_name = config.name_any();
        // Consumed up front: with no record to interrupt, the next build is
        // made from the current inputs anyway
        let rebuild = self.take_rebuild_request(&config_name);
        let existing = match self.pool_record(&config).await {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(()),
            Err(e) => {
                if rebuild {
                    self.request_rebuild(&config_name);
                }
                return Err(e);
            }
        };

        match existing {
            (_, Some(record)) if rebuild => {
                let result = self.handle_inputs_changed(record, &config).await;
                if result.is_err() {
                    self.request_rebuild(&config_name);
                }
                result
            }
            (_, Some(record)) => self.reconcile_record(record).await,
            (pool, None) => self.create_and_start(&config, &pool).await,
        }
    }

    /// The layered pool `config` targets and its record for the desired
    /// configuration. `None` when the pool does not want a build.
    async fn pool_record(
        &self,
        config: &BuildConfiguration,
    ) -> Result<Option<(NodePool, Option<BuildRecord>)>, ControllerError> {
        let pool_name = &config.spec.pool.name;
        let Some(pool) = optional(self.ctx.store.get_node_pool(pool_name).await)? else {
            debug!("Pool {} of {} does not exist", pool_name, config.name_any());
            return Ok(None);
        };
        if !pool.layering_enabled() {
            debug!("Pool {} does not take part in layered builds", pool_name);
            return Ok(None);
        }
        let desired = &pool.spec.configuration.name;
        if desired.is_empty() {
            debug!("Pool {} has no desired configuration yet", pool_name);
            return Ok(None);
        }
        let record_name = build_record_name(pool_name, desired);
        let record = optional(self.ctx.store.get_build_record(&record_name).await)?;
        Ok(Some((pool, record)))
    }

    /// Applies changed build inputs to the pool's current record.
    async fn handle_inputs_changed(
        &self,
        record: BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<(), ControllerError> {
        let name = record.name_any();
        let phase = BuildPhase::from_status(record.status.as_ref());
        info!("Build inputs of {} changed, record {} is {}", config.name_any(), name, phase);
        match phase {
            BuildPhase::Prepared | BuildPhase::Building => {
                self.delete_builder_object(&record, config).await?;
                self.transition(&name, BuildPhase::Interrupted, |_| {}).await?;
                self.forget(&name);
                self.ctx.queue.add(QueueKey::Build(name));
                Ok(())
            }
            BuildPhase::Pending => {
                self.forget(&name);
                self.start_build(&record).await
            }
            BuildPhase::Interrupted => self.restart_interrupted(&record, config).await,
            BuildPhase::Succeeded | BuildPhase::Failed => {
                self.teardown(&record, config).await?;
                self.ctx.queue.add(QueueKey::Build(config.name_any()));
                Ok(())
            }
        }
    }

    async fn create_and_start(
        &self,
        config: &BuildConfiguration,
        pool: &NodePool,
    ) -> Result<(), ControllerError> {
        let pool_name = pool.name_any();
        let desired = pool.spec.configuration.name.clone();
        let name = build_record_name(&pool_name, &desired);
        let pushspec = ImageReference::parse(&config.spec.build_inputs.rendered_image_pushspec)?
            .with_tag(&desired)?
            .to_string();

        let mut record = BuildRecord::new(
            &name,
            BuildRecordSpec {
                build_configuration: ObjectName {
                    name: config.name_any(),
                },
                desired_config: ObjectName {
                    name: desired.clone(),
                },
                rendered_image_pushspec: pushspec,
            },
        );
        record.metadata.labels = Some(BTreeMap::from([
            (TARGET_POOL_LABEL.to_string(), pool_name),
            (RENDERED_CONFIG_LABEL.to_string(), desired),
        ]));

        let record = match self.ctx.store.create_build_record(&record).await {
            Ok(created) => {
                info!("Created BuildRecord {}", name);
                created
            }
            Err(e) if e.is_already_exists() => {
                debug!("BuildRecord {} already exists", name);
                let existing = self.ctx.store.get_build_record(&name).await?;
                return self.reconcile_record(existing).await;
            }
            Err(e) => return Err(e.into()),
        };
        self.start_build(&record).await
    }

    /// Starts a fresh attempt for an interrupted record when its pool still
    /// wants it.
    async fn restart_interrupted(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<(), ControllerError> {
        let name = record.name_any();
        let pool = optional(self.ctx.store.get_node_pool(&config.spec.pool.name).await)?;
        let wanted = pool.is_some_and(|pool| {
            pool.layering_enabled() && pool.spec.configuration.name == record.spec.desired_config.name
        });
        if !wanted {
            info!("Interrupted record {} is no longer wanted by its pool", name);
            return self.teardown(record, config).await;
        }
        if self.ctx.builder.is_build_running(record, config).await? {
            debug!("Interrupted build for {} is still running, checking later", name);
            self.ctx
                .queue
                .add_after(QueueKey::Build(name), self.ctx.config.update_delay);
            return Ok(());
        }
        cleanup(&*self.ctx.store, &*self.ctx.builder, record, config, true).await?;
        self.forget(&name);
        self.start_build(record).await
    }

    /// Starts a build for `record`. Failures are persisted on the record
    /// before being returned; validation failures also fail the record.
    pub(crate) async fn start_build(&self, record: &BuildRecord) -> Result<(), ControllerError> {
        let name = record.name_any();
        let Err(e) = self.try_start_build(record).await else {
            return Ok(());
        };
        warn!("Failed to start build for {}: {}", name, e);
        let message = e.to_string();
        let persisted = if matches!(e, ControllerError::Validation(_)) {
            self.transition(&name, BuildPhase::Failed, |status| {
                status.last_start_error = Some(message.clone());
            })
            .await
        } else {
            self.update_status(&name, |status| {
                status.last_start_error = Some(message.clone());
            })
            .await
        };
        if let Err(persist_err) = persisted {
            warn!("Failed to record start error on {}: {}", name, persist_err);
        }
        Err(e)
    }

    async fn try_start_build(&self, record: &BuildRecord) -> Result<(), ControllerError> {
        let name = record.name_any();
        let store = &*self.ctx.store;
        let builder = &*self.ctx.builder;

        let config = store.get_build_configuration(owner_name(record)).await?;
        let (config, canonical_inputs) = self.canonicalize_secrets(config).await?;

        let request = match self.assembler.assemble(record, &config).await {
            Err(e) if e.is_already_exists() => {
                info!("Clearing stale build artifacts for {}", name);
                cleanup(store, builder, record, &config, true).await?;
                self.assembler.assemble(record, &config).await?
            }
            other => other?,
        };

        let reference = match builder.start_build(&request).await {
            Err(e) => {
                let e = ControllerError::from(e);
                if e.is_already_exists() {
                    info!("Stale builder object for {}, clearing before retry", name);
                    cleanup(store, builder, record, &config, true).await?;
                }
                return Err(e);
            }
            Ok(reference) => reference,
        };

        self.append_pool_source(&config.spec.pool.name, &reference)
            .await?;
        self.mark_prepared(&name, reference).await?;
        lock(&self.started).insert(name.clone(), record.clone());
        self.ctx.metrics.builds_started.inc();
        info!("Started build {} for {}", request.artifacts.build, name);

        if let Some(inputs) = canonical_inputs {
            if let Err(e) = self.rewrite_secret_refs(&config.name_any(), &inputs).await {
                warn!(
                    "Failed to point {} at canonical secrets: {}",
                    config.name_any(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Replaces secret references with their canonical secrets. The rewritten
    /// inputs are returned when anything changed.
    async fn canonicalize_secrets(
        &self,
        mut config: BuildConfiguration,
    ) -> Result<(BuildConfiguration, Option<BuildInputs>), ControllerError> {
        let inputs = &mut config.spec.build_inputs;
        let mut changed = false;

        let push = self
            .secrets
            .ensure_canonical(&inputs.rendered_image_push_secret.name)
            .await?
            .name_any();
        if push != inputs.rendered_image_push_secret.name {
            inputs.rendered_image_push_secret.name = push;
            changed = true;
        }
        if let Some(pull_ref) = inputs.base_image_pull_secret.as_mut() {
            let pull = self.secrets.ensure_canonical(&pull_ref.name).await?.name_any();
            if pull != pull_ref.name {
                pull_ref.name = pull;
                changed = true;
            }
        }

        let rewritten = changed.then(|| config.spec.build_inputs.clone());
        Ok((config, rewritten))
    }

    async fn delete_builder_object(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<(), ControllerError> {
        match self.ctx.builder.delete_build_object(record, config).await {
            Err(e) => {
                let e = ControllerError::from(e);
                if e.is_not_found() { Ok(()) } else { Err(e) }
            }
            Ok(()) => Ok(()),
        }
    }

    /// Removes a record and everything created for it.
    pub(crate) async fn teardown(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<(), ControllerError> {
        let name = record.name_any();
        if BuildPhase::from_status(record.status.as_ref()).is_active() {
            self.delete_builder_object(record, config).await?;
            self.transition(&name, BuildPhase::Interrupted, |_| {}).await?;
        }
        cleanup(&*self.ctx.store, &*self.ctx.builder, record, config, true).await?;

        let digest = ArtifactNames::for_record(record).digest;
        for result in [
            self.ctx.store.delete_config_map(&digest).await,
            self.ctx.store.delete_build_record(&name).await,
        ] {
            if let Err(e) = result {
                if !e.is_not_found() {
                    return Err(e.into());
                }
            }
        }
        self.forget(&name);
        info!("Removed BuildRecord {}", name);
        Ok(())
    }

    /// The configuration targeting `pool`, if any.
    pub(crate) async fn config_for_pool(
        &self,
        pool: &str,
    ) -> Result<Option<BuildConfiguration>, ControllerError> {
        let mut matching: Vec<BuildConfiguration> = self
            .ctx
            .store
            .list_build_configurations()
            .await?
            .into_iter()
            .filter(|config| config.spec.pool.name == pool)
            .collect();
        matching.sort_by_key(|config| config.name_any());
        if matching.len() > 1 {
            warn!(
                "{} BuildConfigurations target pool {}, using {}",
                matching.len(),
                pool,
                matching[0].name_any()
            );
        }
        Ok(matching.into_iter().next())
    }
}

/// Stand-in owner for a record whose configuration was deleted. Only the
/// names matter for teardown.
fn orphan_owner(record: &BuildRecord) -> BuildConfiguration {
    let pool = record
        .labels()
        .get(TARGET_POOL_LABEL)
        .cloned()
        .unwrap_or_default();
    BuildConfiguration::new(
        owner_name(record),
        BuildConfigurationSpec {
            pool: PoolReference { name: pool },
            build_inputs: BuildInputs::default(),
        },
    )
}
