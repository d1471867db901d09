//! Build request assembly.
//!
//! [`BuildRequestAssembler::prepare`] turns a record and its configuration
//! into an [`ImageBuildRequest`] using cluster-wide image defaults for any
//! input the configuration leaves unset. It only reads from the store.
//! [`BuildRequestAssembler::assemble`] additionally creates the two content
//! objects the build mounts.

use crate::error::ControllerError;
use crate::request::{
    render_containerfile, ArtifactNames, ContainerfileInputs, ImageBuildRequest, OptionalInputs,
    ENTITLEMENT_SECRET, RPM_GPG_SECRET, YUM_REPOS_CONFIG_MAP,
};
use crate::store::{optional, ClusterStore, StoreError};
use crds::{BuildConfiguration, BuildRecord};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// ConfigMap with the default OS image inputs
pub const OS_IMAGE_DEFAULTS_CONFIG_MAP: &str = "os-image-defaults";
pub const BASE_IMAGE_KEY: &str = "baseOSContainerImage";
pub const EXTENSIONS_IMAGE_KEY: &str = "baseOSExtensionsContainerImage";
pub const RELEASE_VERSION_KEY: &str = "releaseVersion";

/// ConfigMap listing the images the controller itself depends on
pub const CONTROLLER_IMAGES_CONFIG_MAP: &str = "controller-images";
pub const IMAGES_KEY: &str = "images.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControllerImages {
    machine_config_operator: String,
}

/// Cluster-wide defaults for build inputs
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageDefaults {
    base_image: Option<String>,
    extensions_image: Option<String>,
    release_version: Option<String>,
    mco_image: String,
}

/// A request plus the rendered configuration it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBuild {
    pub request: ImageBuildRequest,
    pub rendered_content: String,
}

fn config_map_value(config_map: &ConfigMap, key: &str) -> Option<String> {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .filter(|value| !value.is_empty())
        .cloned()
}

fn required(field: &str, value: Option<String>) -> Result<String, ControllerError> {
    value.ok_or_else(|| {
        ControllerError::Validation(format!(
            "{field} is set neither on the build configuration nor in {OS_IMAGE_DEFAULTS_CONFIG_MAP}"
        ))
    })
}

/// Assembles build requests from cluster state.
pub struct BuildRequestAssembler {
    store: Arc<dyn ClusterStore>,
    namespace: String,
}

impl BuildRequestAssembler {
    #[must_use]
    pub fn new(store: Arc<dyn ClusterStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
        }
    }

    async fn image_defaults(&self) -> Result<ImageDefaults, ControllerError> {
        let defaults = self.store.get_config_map(OS_IMAGE_DEFAULTS_CONFIG_MAP).await?;
        let images = self.store.get_config_map(CONTROLLER_IMAGES_CONFIG_MAP).await?;
        let raw = config_map_value(&images, IMAGES_KEY).ok_or_else(|| {
            ControllerError::Validation(format!(
                "{CONTROLLER_IMAGES_CONFIG_MAP} has no {IMAGES_KEY} key"
            ))
        })?;
        let images: ControllerImages = serde_json::from_str(&raw).map_err(|e| {
            ControllerError::Validation(format!("invalid {CONTROLLER_IMAGES_CONFIG_MAP}: {e}"))
        })?;

        Ok(ImageDefaults {
            base_image: config_map_value(&defaults, BASE_IMAGE_KEY),
            extensions_image: config_map_value(&defaults, EXTENSIONS_IMAGE_KEY),
            release_version: config_map_value(&defaults, RELEASE_VERSION_KEY),
            mco_image: images.machine_config_operator,
        })
    }

    /// Not-found is absence; any other lookup failure is returned.
    async fn optional_inputs(&self) -> Result<OptionalInputs, StoreError> {
        let (entitlement, rpm_gpg, yum_repos) = tokio::join!(
            self.store.get_secret(ENTITLEMENT_SECRET),
            self.store.get_secret(RPM_GPG_SECRET),
            self.store.get_config_map(YUM_REPOS_CONFIG_MAP),
        );
        Ok(OptionalInputs {
            entitlement_keys: optional(entitlement)?.is_some(),
            rpm_gpg_keys: optional(rpm_gpg)?.is_some(),
            yum_repos: optional(yum_repos)?.is_some(),
        })
    }

    /// Builds the request for `record` without creating anything.
    pub async fn prepare(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<PreparedBuild, ControllerError> {
        let rendered_name = record.spec.desired_config.name.clone();
        let rendered = self.store.get_rendered_config(&rendered_name).await?;
        let defaults = self.image_defaults().await?;
        let optional_inputs = self.optional_inputs().await?;

        // Private copy; the caller's configuration is never filled in place
        let mut inputs = config.spec.build_inputs.clone();
        inputs.base_image_pullspec = inputs.base_image_pullspec.or(defaults.base_image);
        inputs.extensions_image_pullspec =
            inputs.extensions_image_pullspec.or(defaults.extensions_image);
        inputs.release_version = inputs.release_version.or(defaults.release_version);

        let base_image_pullspec = required(BASE_IMAGE_KEY, inputs.base_image_pullspec)?;
        let extensions_image_pullspec =
            required(EXTENSIONS_IMAGE_KEY, inputs.extensions_image_pullspec)?;
        let release_version = required(RELEASE_VERSION_KEY, inputs.release_version)?;
        let pool = config.spec.pool.name.clone();

        let containerfile = render_containerfile(&ContainerfileInputs {
            pool: &pool,
            rendered_config: &rendered_name,
            base_image: &base_image_pullspec,
            extensions_image: &extensions_image_pullspec,
            mco_image: &defaults.mco_image,
            release_version: &release_version,
            optional_inputs,
            extra: inputs.containerfile.as_deref(),
        });

        let request = ImageBuildRequest {
            namespace: self.namespace.clone(),
            pool,
            record: record.name_any(),
            configuration: config.name_any(),
            artifacts: ArtifactNames::for_rendered_config(&rendered_name),
            rendered_config: rendered_name,
            builder_type: inputs.image_builder.image_builder_type,
            base_image_pullspec,
            extensions_image_pullspec,
            release_version,
            mco_image_pullspec: defaults.mco_image,
            base_image_pull_secret: inputs.base_image_pull_secret.map(|s| s.name),
            push_secret: inputs.rendered_image_push_secret.name,
            pushspec: record.spec.rendered_image_pushspec.clone(),
            containerfile,
            optional_inputs,
        };
        debug!("Prepared build request for {}", request.record);

        Ok(PreparedBuild {
            request,
            rendered_content: rendered.spec.content,
        })
    }

    /// Prepares the request and creates its content objects.
    ///
    /// An already-existing content object is returned as an error for the
    /// caller to resolve.
    pub async fn assemble(
        &self,
        record: &BuildRecord,
        config: &BuildConfiguration,
    ) -> Result<ImageBuildRequest, ControllerError> {
        let PreparedBuild {
            request,
            rendered_content,
        } = self.prepare(record, config).await?;

        self.store
            .create_config_map(&request.rendered_config_map(&rendered_content))
            .await?;
        self.store
            .create_config_map(&request.containerfile_config_map())
            .await?;
        info!(
            "Created content objects {} and {} for {}",
            request.artifacts.rendered_config, request.artifacts.containerfile, request.record
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CONTAINERFILE_KEY, RENDERED_CONFIG_KEY};
    use crate::store::MockClusterStore;
    use crate::test_utils::*;

    fn assembler(store: &MockClusterStore) -> BuildRequestAssembler {
        BuildRequestAssembler::new(Arc::new(store.clone()), TEST_NAMESPACE)
    }

    #[tokio::test]
    async fn test_prepare_is_deterministic() {
        let store = MockClusterStore::new();
        let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        let record = create_test_build_record(&config, "rendered-worker-1");
        let assembler = assembler(&store);

        let first = assembler.prepare(&record, &config).await.unwrap();
        let second = assembler.prepare(&record, &config).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.request.pool, "worker");
        assert_eq!(first.request.base_image_pullspec, TEST_BASE_IMAGE);
        assert_eq!(first.request.mco_image_pullspec, TEST_MCO_IMAGE);
        assert_eq!(first.request.pushspec, record.spec.rendered_image_pushspec);
        assert_eq!(store.calls("create_config_map"), 0);
    }

    #[tokio::test]
    async fn test_assemble_is_deterministic_across_clusters() {
        let requests = {
            let mut out = Vec::new();
            for _ in 0..2 {
                let store = MockClusterStore::new();
                let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
                let record = create_test_build_record(&config, "rendered-worker-1");
                let request = assembler(&store).assemble(&record, &config).await.unwrap();
                let containerfile: ConfigMap = store.peek(&request.artifacts.containerfile).unwrap();
                out.push((request, containerfile.data));
            }
            out
        };
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn test_assemble_creates_content_objects() {
        let store = MockClusterStore::new();
        let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        let record = create_test_build_record(&config, "rendered-worker-1");

        let request = assembler(&store).assemble(&record, &config).await.unwrap();

        let rendered: ConfigMap = store.peek("rendered-config-rendered-worker-1").unwrap();
        assert_eq!(
            rendered.data.unwrap().get(RENDERED_CONFIG_KEY).map(String::as_str),
            Some(TEST_RENDERED_CONTENT)
        );
        let containerfile: ConfigMap = store.peek("containerfile-rendered-worker-1").unwrap();
        assert_eq!(
            containerfile.data.unwrap().get(CONTAINERFILE_KEY),
            Some(&request.containerfile)
        );
    }

    #[tokio::test]
    async fn test_assemble_surfaces_existing_content_object() {
        let store = MockClusterStore::new();
        let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        let record = create_test_build_record(&config, "rendered-worker-1");
        let assembler = assembler(&store);

        assembler.assemble(&record, &config).await.unwrap();
        let err = assembler.assemble(&record, &config).await.unwrap_err();

        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_prepare_fills_defaults_without_mutating_config() {
        let store = MockClusterStore::new();
        let mut config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        config.spec.build_inputs.base_image_pullspec = None;
        config.spec.build_inputs.release_version = Some("4.99".to_string());
        let before = config.clone();
        let record = create_test_build_record(&config, "rendered-worker-1");

        let prepared = assembler(&store).prepare(&record, &config).await.unwrap();

        assert_eq!(prepared.request.base_image_pullspec, TEST_BASE_IMAGE);
        assert_eq!(prepared.request.release_version, "4.99");
        assert_eq!(config.spec, before.spec);
    }

    #[tokio::test]
    async fn test_prepare_fails_fast_without_rendered_config() {
        let store = MockClusterStore::new();
        let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        let record = create_test_build_record(&config, "rendered-worker-2");

        let err = assembler(&store).assemble(&record, &config).await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(store.calls("create_config_map"), 0);
    }

    #[tokio::test]
    async fn test_optional_inputs_presence() {
        let store = MockClusterStore::new();
        let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        let record = create_test_build_record(&config, "rendered-worker-1");
        store.seed(create_test_secret(ENTITLEMENT_SECRET, "Opaque"));

        let prepared = assembler(&store).prepare(&record, &config).await.unwrap();

        assert_eq!(
            prepared.request.optional_inputs,
            OptionalInputs {
                entitlement_keys: true,
                rpm_gpg_keys: false,
                yum_repos: false,
            }
        );
        assert!(prepared.request.containerfile.contains("/etc/pki/entitlement/"));
    }

    #[tokio::test]
    async fn test_optional_input_lookup_failure_is_fatal() {
        let store = MockClusterStore::new();
        let config = seed_layered_pool(&store, "worker", "rendered-worker-1");
        let record = create_test_build_record(&config, "rendered-worker-1");
        store.fail_next("get_secret", StoreError::Other("forbidden".into()));

        assert!(assembler(&store).prepare(&record, &config).await.is_err());
    }
}
