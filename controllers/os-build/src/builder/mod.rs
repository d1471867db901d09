//! Build backends.
//!
//! The reconciler talks to a backend only through [`ImageBuilder`]. Which
//! backend runs is decided once at startup from the `imageBuilderType` key of
//! the `os-build-config` ConfigMap.

pub mod native;
pub mod pod;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockImageBuilder;

use crate::config::{BUILDER_CONFIG_MAP, BUILDER_TYPE_KEY};
use crate::error::{BuilderError, ControllerError};
use crate::request::ImageBuildRequest;
use crate::store::{optional, ClusterStore};
use crds::{BuildConfiguration, BuildRecord, BuilderReference, ImageBuilderKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Phase of a builder object as seen by its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedBuildState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A change in a builder object, reported back to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildObservation {
    /// Pool the build is for
    pub pool: String,
    /// BuildRecord the builder object was created for, when labelled
    pub record: Option<String>,
    /// Builder object name
    pub object_name: String,
    /// Builder object uid
    pub uid: Option<String>,
    pub state: ObservedBuildState,
    /// Image digest, when the backend reports it alongside success
    pub digest: Option<String>,
}

/// Receives builder observations.
///
/// Implementations must not lose an observation to a transient failure:
/// backends report each phase change once and do not resend it.
#[async_trait::async_trait]
pub trait BuildObserver: Send + Sync {
    async fn observe(&self, observation: BuildObservation) -> Result<(), ControllerError>;
}

/// Handles a backend's run loop needs.
#[derive(Clone)]
pub struct BuilderRunContext {
    /// Cancelled on shutdown
    pub shutdown: CancellationToken,
    /// Where observations go
    pub observer: Arc<dyn BuildObserver>,
}

impl std::fmt::Debug for BuilderRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRunContext").finish_non_exhaustive()
    }
}

/// Capability interface every build backend implements.
#[async_trait::async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Backend kind, recorded in builder references
    fn kind(&self) -> ImageBuilderKind;

    /// Runs the backend's own event loop until `ctx.shutdown` is cancelled.
    async fn run(&self, ctx: BuilderRunContext, workers: usize) -> Result<(), BuilderError>;

    /// Creates the builder object for `request`.
    async fn start_build(
        &self,
        request: &ImageBuildRequest,
    ) -> Result<BuilderReference, BuilderError>;

    /// Whether a builder object for the record exists and has not finished.
    async fn is_build_running(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<bool, BuilderError>;

    /// Deletes the record's builder object. Missing objects are a not-found error.
    async fn delete_build_object(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<(), BuilderError>;
}

/// Parses the backend selection value.
///
/// Unset or empty selects the pod backend; unknown values are an error.
pub fn parse_builder_type(value: Option<&str>) -> Result<ImageBuilderKind, ControllerError> {
    match value.map(str::trim) {
        None | Some("") | Some("custom-pod-builder") => Ok(ImageBuilderKind::PodImageBuilder),
        Some("native-image-builder") => Ok(ImageBuilderKind::NativeImageBuilder),
        Some(other) => Err(ControllerError::InvalidConfig(format!(
            "invalid {BUILDER_TYPE_KEY} {other:?}, expected \"custom-pod-builder\" or \"native-image-builder\""
        ))),
    }
}

/// Reads the backend selection. `Ok(None)` means the ConfigMap does not exist yet.
pub async fn select_builder_type(
    store: &dyn ClusterStore,
) -> Result<Option<ImageBuilderKind>, ControllerError> {
    let Some(config_map) = optional(store.get_config_map(BUILDER_CONFIG_MAP).await)? else {
        return Ok(None);
    };
    let value = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(BUILDER_TYPE_KEY))
        .map(String::as_str);
    parse_builder_type(value).map(Some)
}
