//! Lifecycle writes.
//!
//! Every write re-reads the object inside [`retry_on_conflict`], so a
//! conflicting concurrent update recomputes the whole status from fresh
//! state instead of patching a stale copy.

use super::Reconciler;
use crate::backoff::retry_on_conflict;
use crate::cleanup::cleanup;
use crate::error::ControllerError;
use crate::image_ref::ImageReference;
use crate::lifecycle::BuildPhase;
use crate::request::{ArtifactNames, DIGEST_KEY};
use crate::store::{optional, StoreError};
use chrono::Utc;
use crds::{
    BuildConfiguration, BuildInputs, BuildRecord, BuildRecordStatus, BuilderReference,
    ConfigurationSource, ImageBuilderKind,
};
use kube::ResourceExt;
use tracing::{debug, info};

fn source_api_version(reference: &BuilderReference) -> &'static str {
    match reference.image_builder_type {
        ImageBuilderKind::PodImageBuilder => "v1",
        ImageBuilderKind::NativeImageBuilder => "build.openshift.io/v1",
    }
}

impl Reconciler {
    /// Moves record `name` to `next` and applies `mutate` to the new status.
    ///
    /// Re-entering the current phase only applies `mutate`. Nothing is
    /// written when the status ends up unchanged.
    pub(crate) async fn transition<F>(
        &self,
        name: &str,
        next: BuildPhase,
        mutate: F,
    ) -> Result<BuildRecord, ControllerError>
    where
        F: Fn(&mut BuildRecordStatus) + Send + Sync,
    {
        let store = &*self.ctx.store;
        let mutate = &mutate;
        let (record, from) = retry_on_conflict(&self.ctx.config.conflict_retry, || async move {
            let mut record = store.get_build_record(name).await?;
            let current = BuildPhase::from_status(record.status.as_ref());
            current.transition_to(next)?;

            let previous = record.status.clone().unwrap_or_default();
            let mut status = previous.clone();
            if current != next {
                let now = Utc::now();
                status.conditions = next.render(&previous.conditions, now);
                if next.is_terminal() {
                    status.build_end = Some(now);
                }
            }
            mutate(&mut status);
            if status == previous {
                return Ok((record, current));
            }
            record.status = Some(status);
            Ok((store.update_build_record_status(&record).await?, current))
        })
        .await?;

        if from != next {
            info!("BuildRecord {} transitioned {} -> {}", name, from, next);
            let phase = next.to_string();
            self.ctx
                .metrics
                .transitions
                .with_label_values(&[phase.as_str()])
                .inc();
        }
        Ok(record)
    }

    /// Applies `mutate` without changing the phase.
    pub(crate) async fn update_status<F>(
        &self,
        name: &str,
        mutate: F,
    ) -> Result<BuildRecord, ControllerError>
    where
        F: Fn(&mut BuildRecordStatus) + Send + Sync,
    {
        let store = &*self.ctx.store;
        let mutate = &mutate;
        retry_on_conflict(&self.ctx.config.conflict_retry, || async move {
            let mut record = store.get_build_record(name).await?;
            let previous = record.status.clone().unwrap_or_default();
            let mut status = previous.clone();
            mutate(&mut status);
            if status == previous {
                return Ok(record);
            }
            record.status = Some(status);
            Ok(store.update_build_record_status(&record).await?)
        })
        .await
    }

    /// Records the new builder object and enters Prepared.
    pub(crate) async fn mark_prepared(
        &self,
        name: &str,
        reference: BuilderReference,
    ) -> Result<BuildRecord, ControllerError> {
        let started = Utc::now();
        self.transition(name, BuildPhase::Prepared, |status| {
            status.builder_reference = Some(reference.clone());
            status.build_start = Some(started);
            status.build_end = None;
            status.final_image_pushspec = None;
            status.last_start_error = None;
        })
        .await
    }

    /// Adds the builder object to the pool's configuration sources.
    pub(crate) async fn append_pool_source(
        &self,
        pool: &str,
        reference: &BuilderReference,
    ) -> Result<(), ControllerError> {
        let store = &*self.ctx.store;
        let source = ConfigurationSource {
            api_version: source_api_version(reference).to_string(),
            kind: reference.kind.clone(),
            name: reference.name.clone(),
            namespace: Some(reference.namespace.clone()),
            uid: reference.uid.clone(),
        };
        let source = &source;
        retry_on_conflict(&self.ctx.config.conflict_retry, || async move {
            let mut node_pool = store.get_node_pool(pool).await?;
            let sources = &mut node_pool.spec.configuration.source;
            if sources.contains(source) {
                return Ok(());
            }
            sources.push(source.clone());
            store.update_node_pool(&node_pool).await?;
            Ok(())
        })
        .await?;
        debug!("Added {} {} to pool {} sources", reference.kind, reference.name, pool);
        Ok(())
    }

    /// Publishes a finished build.
    ///
    /// The digest written by the backend pins the record's pushspec. A digest
    /// reported with the observation is used when the ConfigMap is missing.
    /// Build artifacts are removed, the configuration's current image is
    /// updated, and only then does the record enter Succeeded.
    pub(crate) async fn mark_succeeded(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
        reported: Option<&str>,
    ) -> Result<(), ControllerError> {
        let name = record.name_any();
        let names = ArtifactNames::for_record(record);
        let digest = match optional(self.ctx.store.get_config_map(&names.digest).await)? {
            Some(digest_map) => digest_map
                .data
                .as_ref()
                .and_then(|data| data.get(DIGEST_KEY))
                .map(|digest| digest.trim().to_string())
                .ok_or_else(|| {
                    ControllerError::Validation(format!(
                        "{} has no {DIGEST_KEY} key",
                        names.digest
                    ))
                })?,
            None => match reported {
                Some(digest) => digest.trim().to_string(),
                None => {
                    return Err(StoreError::NotFound(format!("ConfigMap/{}", names.digest)).into())
                }
            },
        };
        let pullspec = ImageReference::parse(&record.spec.rendered_image_pushspec)?
            .with_digest(&digest)?
            .to_string();

        // Observations may be redelivered, so artifacts can already be gone
        cleanup(&*self.ctx.store, &*self.ctx.builder, record, config, true).await?;
        self.publish_image(&config.name_any(), &pullspec).await?;
        self.transition(&name, BuildPhase::Succeeded, |status| {
            status.final_image_pushspec = Some(pullspec.clone());
        })
        .await?;

        if let Err(e) = self.ctx.store.delete_config_map(&names.digest).await {
            if !e.is_not_found() {
                return Err(e.into());
            }
        }
        info!("Build {} succeeded: {}", name, pullspec);
        Ok(())
    }

    async fn publish_image(&self, config: &str, pullspec: &str) -> Result<(), ControllerError> {
        let store = &*self.ctx.store;
        retry_on_conflict(&self.ctx.config.conflict_retry, || async move {
            let mut current = store.get_build_configuration(config).await?;
            let status = current.status.get_or_insert_with(Default::default);
            if status.current_image_pullspec.as_deref() == Some(pullspec) {
                return Ok(());
            }
            status.current_image_pullspec = Some(pullspec.to_string());
            store.update_build_configuration_status(&current).await?;
            Ok(())
        })
        .await
    }

    /// Points the configuration at the canonical secrets in `inputs`.
    pub(crate) async fn rewrite_secret_refs(
        &self,
        config: &str,
        inputs: &BuildInputs,
    ) -> Result<(), ControllerError> {
        let store = &*self.ctx.store;
        retry_on_conflict(&self.ctx.config.conflict_retry, || async move {
            let mut current = store.get_build_configuration(config).await?;
            let current_inputs = &mut current.spec.build_inputs;
            if current_inputs.rendered_image_push_secret == inputs.rendered_image_push_secret
                && current_inputs.base_image_pull_secret == inputs.base_image_pull_secret
            {
                return Ok(());
            }
            current_inputs
                .rendered_image_push_secret
                .clone_from(&inputs.rendered_image_push_secret);
            current_inputs
                .base_image_pull_secret
                .clone_from(&inputs.base_image_pull_secret);
            store.update_build_configuration(&current).await?;
            info!("BuildConfiguration {} now uses canonical secrets", config);
            Ok(())
        })
        .await
    }
}
