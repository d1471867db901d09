//! Pool-driven decisions.
//!
//! [`pool_change`] is evaluated by the event router against cached objects.
//! Its outcome is queued so the resulting work gets deduplication and retry.

use super::{orphan_owner, Reconciler};
use crate::error::ControllerError;
use crate::request::{owner_name, TARGET_POOL_LABEL};
use crate::store::optional;
use crds::{BuildRecord, NodePool};
use kube::ResourceExt;
use tracing::{debug, info};

/// Outcome of a pool update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolChange {
    /// The pool left layered builds; its records must be removed
    OptOut,
    /// The pool wants a rendered configuration no record covers yet
    BuildDue,
    UpToDate,
}

/// Decides what a pool update means for builds.
///
/// `has_config` is whether a BuildConfiguration targets the pool and
/// `record` is the record for the pool's current desired configuration.
#[must_use]
pub fn pool_change(
    old: Option<&NodePool>,
    current: &NodePool,
    has_config: bool,
    record: Option<&BuildRecord>,
) -> PoolChange {
    let was_layered = old.is_some_and(NodePool::layering_enabled);
    if was_layered && !current.layering_enabled() {
        return PoolChange::OptOut;
    }
    if !current.layering_enabled() || !has_config || current.spec.configuration.name.is_empty() {
        return PoolChange::UpToDate;
    }
    match record {
        None => PoolChange::BuildDue,
        Some(_) => PoolChange::UpToDate,
    }
}

impl Reconciler {
    /// Creates or advances the record for the pool's desired configuration.
    pub(crate) async fn reconcile_pool_build(&self, pool: &str) -> Result<(), ControllerError> {
        let Some(config) = self.config_for_pool(pool).await? else {
            debug!("No BuildConfiguration targets pool {}", pool);
            return Ok(());
        };
        self.reconcile_configuration(config).await
    }

    /// Removes every record of a pool that left layered builds.
    ///
    /// A pool that opted back in before this runs is left alone.
    pub(crate) async fn finalize_opt_out(&self, pool: &str) -> Result<(), ControllerError> {
        if let Some(current) = optional(self.ctx.store.get_node_pool(pool).await)? {
            if current.layering_enabled() {
                debug!("Pool {} opted back in, keeping its records", pool);
                return Ok(());
            }
        }

        let records: Vec<BuildRecord> = self
            .ctx
            .store
            .list_build_records()
            .await?
            .into_iter()
            .filter(|record| record.labels().get(TARGET_POOL_LABEL).map(String::as_str) == Some(pool))
            .collect();
        info!("Pool {} opted out, removing {} build records", pool, records.len());

        let mut errors = Vec::new();
        for record in &records {
            let config = match optional(
                self.ctx
                    .store
                    .get_build_configuration(owner_name(record))
                    .await,
            ) {
                Ok(config) => config.unwrap_or_else(|| orphan_owner(record)),
                Err(e) => {
                    errors.push(e.into());
                    continue;
                }
            };
            if let Err(e) = self.teardown(record, &config).await {
                errors.push(e);
            }
        }
        ControllerError::aggregate(errors)
    }
}
