//! Native build backend.
//!
//! Builds run as `build.openshift.io/v1` Build objects using the Docker
//! strategy. The backend's run loop watches its Builds, writes the digest
//! ConfigMap when one completes, and forwards every phase change to the
//! observer.

use super::{BuildObservation, BuilderRunContext, ImageBuilder, ObservedBuildState};
use crate::error::BuilderError;
use crate::request::{
    ArtifactNames, ImageBuildRequest, BUILD_RECORD_LABEL, DIGEST_KEY, EPHEMERAL_LABEL,
    ENTITLEMENT_SECRET, RENDERED_CONFIG_LABEL, RPM_GPG_SECRET, TARGET_POOL_LABEL, YUM_REPOS_CONFIG_MAP,
};
use crate::store::ClusterStore;
use crds::{BuildConfiguration, BuildRecord, BuilderReference, ImageBuilderKind};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Native Build backend
pub struct NativeImageBuilder {
    builds: Api<DynamicObject>,
    resource: ApiResource,
    store: Arc<dyn ClusterStore>,
    namespace: String,
}

impl NativeImageBuilder {
    #[must_use]
    pub fn new(client: Client, store: Arc<dyn ClusterStore>, namespace: &str) -> Self {
        let resource =
            ApiResource::from_gvk(&GroupVersionKind::gvk("build.openshift.io", "v1", "Build"));
        Self {
            builds: Api::namespaced_with(client, namespace, &resource),
            resource,
            store,
            namespace: namespace.to_string(),
        }
    }

    /// Writes the digest ConfigMap for a completed build. An existing one
    /// is left alone.
    async fn publish_digest(&self, build: &DynamicObject) -> Result<(), BuilderError> {
        let Some(digest) = build_digest(build) else {
            return Err(BuilderError::Backend(format!(
                "build {} completed without an image digest",
                build.name_any()
            )));
        };
        let Some(rendered) = build.labels().get(RENDERED_CONFIG_LABEL) else {
            return Err(BuilderError::Backend(format!(
                "build {} has no rendered-config label",
                build.name_any()
            )));
        };
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(ArtifactNames::for_rendered_config(rendered).digest),
                namespace: Some(self.namespace.clone()),
                labels: Some(build.labels().clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(DIGEST_KEY.to_string(), digest.to_string())])),
            ..Default::default()
        };
        match self.store.create_config_map(&config_map).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other.map(|_| ()).map_err(Into::into),
        }
    }

    async fn handle_build(&self, build: DynamicObject, ctx: &BuilderRunContext) {
        let name = build.name_any();
        let Some(state) = build_phase(&build) else {
            debug!("Build {} has no phase yet", name);
            return;
        };
        let Some(pool) = build.labels().get(TARGET_POOL_LABEL).cloned() else {
            warn!("Build {} has no target pool label, ignoring", name);
            return;
        };
        let mut digest = None;
        if state == ObservedBuildState::Succeeded {
            // Publishing falls back to the digest on the observation
            if let Err(e) = self.publish_digest(&build).await {
                warn!("Failed to publish digest for build {}: {}", name, e);
            }
            digest = build_digest(&build).map(str::to_string);
        }
        let observation = BuildObservation {
            pool,
            record: build.labels().get(BUILD_RECORD_LABEL).cloned(),
            object_name: name.clone(),
            uid: build.uid(),
            state,
            digest,
        };
        if let Err(e) = ctx.observer.observe(observation).await {
            warn!("Failed to handle build {} update: {}", name, e);
        }
    }
}

/// Maps a Build's `status.phase` onto an observed state.
fn build_phase(build: &DynamicObject) -> Option<ObservedBuildState> {
    let phase = build.data.pointer("/status/phase").and_then(Value::as_str)?;
    Some(match phase {
        "New" | "Pending" => ObservedBuildState::Pending,
        "Running" => ObservedBuildState::Running,
        "Complete" => ObservedBuildState::Succeeded,
        // Failed, Error and Cancelled all end the attempt
        _ => ObservedBuildState::Failed,
    })
}

fn build_digest(build: &DynamicObject) -> Option<&str> {
    build
        .data
        .pointer("/status/output/to/imageDigest")
        .and_then(Value::as_str)
}

fn build_manifest(request: &ImageBuildRequest) -> Value {
    let names = &request.artifacts;
    let mut secrets = Vec::new();
    for (present, secret) in [
        (request.optional_inputs.entitlement_keys, ENTITLEMENT_SECRET),
        (request.optional_inputs.rpm_gpg_keys, RPM_GPG_SECRET),
    ] {
        if present {
            secrets.push(json!({ "secret": { "name": secret }, "destinationDir": secret }));
        }
    }
    let mut config_maps = vec![json!({
        "configMap": { "name": names.rendered_config },
        "destinationDir": "rendered-config",
    })];
    if request.optional_inputs.yum_repos {
        config_maps.push(json!({
            "configMap": { "name": YUM_REPOS_CONFIG_MAP },
            "destinationDir": YUM_REPOS_CONFIG_MAP,
        }));
    }
    let mut docker_strategy = json!({
        "from": { "kind": "DockerImage", "name": request.base_image_pullspec },
        "imageOptimizationPolicy": "SkipLayers",
    });
    if let Some(pull_secret) = &request.base_image_pull_secret {
        docker_strategy["pullSecret"] = json!({ "name": pull_secret });
    }
    json!({
        "spec": {
            "source": {
                "type": "Dockerfile",
                "dockerfile": request.containerfile,
                "configMaps": config_maps,
                "secrets": secrets,
            },
            "strategy": { "type": "Docker", "dockerStrategy": docker_strategy },
            "output": {
                "to": { "kind": "DockerImage", "name": request.pushspec },
                "pushSecret": { "name": request.push_secret },
            },
            "nodeSelector": null,
        }
    })
}

#[async_trait::async_trait]
impl ImageBuilder for NativeImageBuilder {
    fn kind(&self) -> ImageBuilderKind {
        ImageBuilderKind::NativeImageBuilder
    }

    async fn run(&self, ctx: BuilderRunContext, workers: usize) -> Result<(), BuilderError> {
        info!("Native image builder running with {} workers", workers);
        let config = watcher::Config::default().labels(&format!("{EPHEMERAL_LABEL}=true"));
        let builds = watcher(self.builds.clone(), config)
            .default_backoff()
            .applied_objects()
            .filter_map(|result| async move {
                match result {
                    Ok(build) => Some(build),
                    Err(e) => {
                        warn!("Build watch error: {}", e);
                        None
                    }
                }
            })
            .for_each_concurrent(workers.max(1), |build| self.handle_build(build, &ctx));

        tokio::select! {
            () = ctx.shutdown.cancelled() => {}
            () = builds => warn!("Build watch stream ended"),
        }
        info!("Native image builder stopped");
        Ok(())
    }

    async fn start_build(
        &self,
        request: &ImageBuildRequest,
    ) -> Result<BuilderReference, BuilderError> {
        let mut build = DynamicObject::new(&request.artifacts.build, &self.resource)
            .within(&request.namespace)
            .data(build_manifest(request));
        build.metadata.labels = Some(request.labels());
        let created = self
            .builds
            .create(&PostParams::default(), &build)
            .await
            .map_err(|e| {
                BuilderError::Store(crate::store::StoreError::from_kube(
                    format!("build/{}", request.artifacts.build),
                    e,
                ))
            })?;
        info!("Created build {} for {}", created.name_any(), request.record);
        Ok(BuilderReference {
            image_builder_type: self.kind(),
            kind: "Build".to_string(),
            name: created.name_any(),
            namespace: request.namespace.clone(),
            uid: created.uid(),
        })
    }

    async fn is_build_running(
        &self,
        record: &BuildRecord,
        _config: &BuildConfiguration,
    ) -> Result<bool, BuilderError> {
        let name = ArtifactNames::for_record(record).build;
        let Some(build) = self.builds.get_opt(&name).await? else {
            return Ok(false);
        };
        Ok(matches!(
            build_phase(&build),
            None | Some(ObservedBuildState::Pending | ObservedBuildState::Running)
        ))
    }

    async fn delete_build_object(
        &self,
        record: &BuildRecord,
        _config: &BuildConfiguration,
    ) -> Result<(), BuilderError> {
        let name = ArtifactNames::for_record(record).build;
        self.builds
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| {
                BuilderError::Store(crate::store::StoreError::from_kube(format!("build/{name}"), e))
            })?;
        info!("Deleted build {}", name);
        Ok(())
    }
}
