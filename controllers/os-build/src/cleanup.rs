//! Post-build cleanup of ephemeral objects.

use crate::builder::ImageBuilder;
use crate::error::ControllerError;
use crate::request::ArtifactNames;
use crate::store::ClusterStore;
use crds::{BuildConfiguration, BuildRecord};
use kube::ResourceExt;
use tracing::{debug, warn};

/// Deletes the builder object and both content objects of `record`.
///
/// The three deletions run concurrently and are all attempted. With
/// `ignore_missing`, not-found counts as deleted. Remaining failures are
/// returned together.
pub async fn cleanup(
    store: &dyn ClusterStore,
    builder: &dyn ImageBuilder,
    record: &BuildRecord,
    config: &BuildConfiguration,
    ignore_missing: bool,
) -> Result<(), ControllerError> {
    let names = ArtifactNames::for_record(record);
    let (build, rendered, containerfile) = tokio::join!(
        builder.delete_build_object(record, config),
        store.delete_config_map(&names.rendered_config),
        store.delete_config_map(&names.containerfile),
    );

    let errors: Vec<ControllerError> = [
        build.map_err(ControllerError::from),
        rendered.map_err(ControllerError::from),
        containerfile.map_err(ControllerError::from),
    ]
    .into_iter()
    .filter_map(Result::err)
    .filter(|e| !(ignore_missing && e.is_not_found()))
    .collect();

    if errors.is_empty() {
        debug!("Cleaned up build artifacts for {}", record.name_any());
    } else {
        warn!(
            "Cleanup for {} failed for {} of 3 artifacts",
            record.name_any(),
            errors.len()
        );
    }
    ControllerError::aggregate(errors)
}
