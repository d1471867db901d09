//! Pod build backend.
//!
//! Each build is a single pod: one container builds and pushes the image and
//! writes the pushed digest to a shared volume, a second one waits for that
//! file and stores it in the digest ConfigMap. Pod phase changes are picked
//! up by the pod watcher, so [`ImageBuilder::run`] only waits for shutdown.

use super::{BuilderRunContext, ImageBuilder};
use crate::error::BuilderError;
use crate::request::{
    ArtifactNames, ImageBuildRequest, CONTAINERFILE_KEY, DIGEST_KEY, ENTITLEMENT_SECRET,
    RPM_GPG_SECRET, YUM_REPOS_CONFIG_MAP,
};
use crate::store::{optional, ClusterStore};
use crds::{BuildConfiguration, BuildRecord, BuilderReference, ImageBuilderKind};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Label identifying build pods
pub const BUILD_POD_LABEL: &str = "osbuild.microscaler.io/build-pod";

/// Service account build pods run as
const BUILDER_SERVICE_ACCOUNT: &str = "os-builder";

/// Image carrying buildah for the build container
const BUILDAH_IMAGE: &str = "quay.io/buildah/stable:latest";

/// Pod-based backend
pub struct PodImageBuilder {
    store: Arc<dyn ClusterStore>,
}

impl PodImageBuilder {
    #[must_use]
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }
}

fn secret_volume(name: &str, secret: &str) -> Value {
    json!({ "name": name, "secret": { "secretName": secret } })
}

fn config_map_volume(name: &str, config_map: &str) -> Value {
    json!({ "name": name, "configMap": { "name": config_map } })
}

/// Builds the pod manifest for `request`.
pub fn build_pod(request: &ImageBuildRequest) -> Result<Pod, BuilderError> {
    let names = &request.artifacts;
    let mut labels = request.labels();
    labels.insert(BUILD_POD_LABEL.to_string(), "true".to_string());

    let mut volumes = vec![
        config_map_volume("containerfile", &names.containerfile),
        config_map_volume("rendered-config", &names.rendered_config),
        secret_volume("push-secret", &request.push_secret),
        json!({ "name": "done", "emptyDir": {} }),
        json!({ "name": "buildah-cache", "emptyDir": {} }),
    ];
    let mut mounts = vec![
        json!({ "name": "containerfile", "mountPath": "/tmp/containerfile" }),
        json!({ "name": "rendered-config", "mountPath": "/tmp/context/rendered-config" }),
        json!({ "name": "push-secret", "mountPath": "/tmp/push-secret" }),
        json!({ "name": "done", "mountPath": "/tmp/done" }),
        json!({ "name": "buildah-cache", "mountPath": "/var/lib/containers" }),
    ];
    if let Some(pull_secret) = &request.base_image_pull_secret {
        volumes.push(secret_volume("base-pull-secret", pull_secret));
        mounts.push(json!({ "name": "base-pull-secret", "mountPath": "/tmp/base-pull-secret" }));
    }
    let optional_inputs = [
        (request.optional_inputs.entitlement_keys, ENTITLEMENT_SECRET, true),
        (request.optional_inputs.rpm_gpg_keys, RPM_GPG_SECRET, true),
        (request.optional_inputs.yum_repos, YUM_REPOS_CONFIG_MAP, false),
    ];
    for (present, name, is_secret) in optional_inputs {
        if !present {
            continue;
        }
        volumes.push(if is_secret {
            secret_volume(name, name)
        } else {
            config_map_volume(name, name)
        });
        mounts.push(json!({ "name": name, "mountPath": format!("/tmp/context/{name}") }));
    }

    let pull_auth = if request.base_image_pull_secret.is_some() {
        "--authfile=/tmp/base-pull-secret/.dockerconfigjson"
    } else {
        ""
    };
    let build_script = format!(
        "set -xeuo pipefail\n\
         buildah build --storage-driver vfs {pull_auth} \
         --file /tmp/containerfile/{CONTAINERFILE_KEY} --tag {tag} /tmp/context\n\
         buildah push --storage-driver vfs \
         --authfile=/tmp/push-secret/.dockerconfigjson \
         --digestfile=/tmp/done/digestfile {tag}",
        tag = request.pushspec,
    );
    let wait_script = format!(
        "set -euo pipefail\n\
         while [ ! -f /tmp/done/digestfile ]; do sleep 1; done\n\
         kubectl create configmap {digest} --namespace {namespace} \
         --from-file={DIGEST_KEY}=/tmp/done/digestfile",
        digest = names.digest,
        namespace = request.namespace,
    );

    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": names.build,
            "namespace": request.namespace,
            "labels": labels,
        },
        "spec": {
            "restartPolicy": "Never",
            "serviceAccountName": BUILDER_SERVICE_ACCOUNT,
            "containers": [
                {
                    "name": "image-build",
                    "image": BUILDAH_IMAGE,
                    "command": ["/bin/bash", "-c", build_script],
                    "securityContext": { "privileged": true },
                    "volumeMounts": mounts,
                },
                {
                    "name": "wait-for-done",
                    "image": request.mco_image_pullspec,
                    "command": ["/bin/bash", "-c", wait_script],
                    "volumeMounts": [{ "name": "done", "mountPath": "/tmp/done" }],
                },
            ],
            "volumes": volumes,
        },
    });
    serde_json::from_value(manifest)
        .map_err(|e| BuilderError::Backend(format!("invalid build pod manifest: {e}")))
}

#[async_trait::async_trait]
impl ImageBuilder for PodImageBuilder {
    fn kind(&self) -> ImageBuilderKind {
        ImageBuilderKind::PodImageBuilder
    }

    async fn run(&self, ctx: BuilderRunContext, workers: usize) -> Result<(), BuilderError> {
        info!("Pod image builder running with {} workers", workers);
        ctx.shutdown.cancelled().await;
        info!("Pod image builder stopped");
        Ok(())
    }

    async fn start_build(
        &self,
        request: &ImageBuildRequest,
    ) -> Result<BuilderReference, BuilderError> {
        let pod = self.store.create_pod(&build_pod(request)?).await?;
        info!("Created build pod {} for {}", pod.name_any(), request.record);
        Ok(BuilderReference {
            image_builder_type: self.kind(),
            kind: "Pod".to_string(),
            name: pod.name_any(),
            namespace: request.namespace.clone(),
            uid: pod.uid(),
        })
    }

    async fn is_build_running(
        &self,
        record: &BuildRecord,
        _config: &BuildConfiguration,
    ) -> Result<bool, BuilderError> {
        let name = ArtifactNames::for_record(record).build;
        let Some(pod) = optional(self.store.get_pod(&name).await)? else {
            return Ok(false);
        };
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        debug!("Build pod {} phase {:?}", name, phase);
        Ok(matches!(phase, None | Some("Pending" | "Running")))
    }

    async fn delete_build_object(
        &self,
        record: &BuildRecord,
        _config: &BuildConfiguration,
    ) -> Result<(), BuilderError> {
        let name = ArtifactNames::for_record(record).build;
        self.store.delete_pod(&name).await?;
        info!("Deleted build pod {}", name);
        Ok(())
    }
}
