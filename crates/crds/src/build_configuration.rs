//! BuildConfiguration CRD
//!
//! Declares how a layered OS image is built for one node pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "BuildConfiguration",
    status = "BuildConfigurationStatus",
    shortname = "obc"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigurationSpec {
    /// Pool whose nodes consume the built image
    pub pool: PoolReference,

    /// Everything that goes into a build
    pub build_inputs: BuildInputs,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolReference {
    /// Name of the NodePool
    pub name: String,
}

/// Build inputs. Unset image fields are filled from cluster-wide defaults
/// at assembly time and never written back.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildInputs {
    /// Base OS image pullspec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_pullspec: Option<String>,

    /// Base OS extensions image pullspec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions_image_pullspec: Option<String>,

    /// Release version label stamped on the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_version: Option<String>,

    /// Secret used to pull the base images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_pull_secret: Option<SecretReference>,

    /// Secret used to push the rendered image
    pub rendered_image_push_secret: SecretReference,

    /// Repository the rendered image is pushed to
    pub rendered_image_pushspec: String,

    /// Backend selection
    #[serde(default)]
    pub image_builder: ImageBuilderSpec,

    /// Extra containerfile instructions appended after the generated ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containerfile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name in the controller namespace
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuilderSpec {
    /// Which backend executes the build
    #[serde(rename = "type", default)]
    pub image_builder_type: ImageBuilderKind,
}

/// Build backend kind
///
/// Serializes as PascalCase but also accepts lowercase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ImageBuilderKind {
    /// Build runs in a pod managed by this controller
    #[default]
    #[serde(alias = "podimagebuilder")]
    PodImageBuilder,

    /// Build runs as a native cluster Build object
    #[serde(alias = "nativeimagebuilder")]
    NativeImageBuilder,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigurationStatus {
    /// Digest-qualified pullspec of the last successful build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image_pullspec: Option<String>,
}
