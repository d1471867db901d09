//! In-memory [`ImageBuilder`] for unit testing

use super::{BuilderRunContext, ImageBuilder};
use crate::error::BuilderError;
use crate::request::{ArtifactNames, ImageBuildRequest};
use crate::store::StoreError;
use crds::{BuildConfiguration, BuildRecord, BuilderReference, ImageBuilderKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock build backend
///
/// Builder objects are tracked by name with a running flag. Started requests
/// are kept so tests can inspect them.
#[derive(Clone, Default)]
pub struct MockImageBuilder {
    objects: Arc<Mutex<HashMap<String, bool>>>,
    started: Arc<Mutex<Vec<ImageBuildRequest>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    next_start_error: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for MockImageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockImageBuilder").finish_non_exhaustive()
    }
}

impl MockImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests passed to `start_build`, in order
    #[must_use]
    pub fn started(&self) -> Vec<ImageBuildRequest> {
        lock(&self.started).clone()
    }

    /// Builder object names passed to successful deletes
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    /// Creates or updates a builder object directly
    pub fn set_running(&self, object: &str, running: bool) {
        lock(&self.objects).insert(object.to_string(), running);
    }

    /// Makes the next `start_build` fail
    pub fn fail_next_start(&self, message: &str) {
        *lock(&self.next_start_error) = Some(message.to_string());
    }
}

#[async_trait::async_trait]
impl ImageBuilder for MockImageBuilder {
    fn kind(&self) -> ImageBuilderKind {
        ImageBuilderKind::PodImageBuilder
    }

    async fn run(&self, ctx: BuilderRunContext, _workers: usize) -> Result<(), BuilderError> {
        ctx.shutdown.cancelled().await;
        Ok(())
    }

    async fn start_build(
        &self,
        request: &ImageBuildRequest,
    ) -> Result<BuilderReference, BuilderError> {
        if let Some(message) = lock(&self.next_start_error).take() {
            return Err(BuilderError::Backend(message));
        }
        let name = request.artifacts.build.clone();
        {
            let mut objects = lock(&self.objects);
            if objects.contains_key(&name) {
                return Err(BuilderError::Store(StoreError::AlreadyExists(format!("pod/{name}"))));
            }
            objects.insert(name.clone(), true);
        }
        let mut started = lock(&self.started);
        started.push(request.clone());
        Ok(BuilderReference {
            image_builder_type: self.kind(),
            kind: "Pod".to_string(),
            name,
            namespace: request.namespace.clone(),
            uid: Some(format!("mock-uid-{}", started.len())),
        })
    }

    async fn is_build_running(
        &self,
        record: &BuildRecord,
        _config: &BuildConfiguration,
    ) -> Result<bool, BuilderError> {
        let name = ArtifactNames::for_record(record).build;
        Ok(lock(&self.objects).get(&name).copied().unwrap_or(false))
    }

    async fn delete_build_object(
        &self,
        record: &BuildRecord,
        _config: &BuildConfiguration,
    ) -> Result<(), BuilderError> {
        let name = ArtifactNames::for_record(record).build;
        if lock(&self.objects).remove(&name).is_none() {
            return Err(BuilderError::Store(StoreError::NotFound(format!("pod/{name}"))));
        }
        lock(&self.deleted).push(name);
        Ok(())
    }
}
