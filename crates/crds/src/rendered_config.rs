//! RenderedConfig CRD
//!
//! Fully resolved configuration content for a pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "RenderedConfig",
    shortname = "rc"
)]
#[serde(rename_all = "camelCase")]
pub struct RenderedConfigSpec {
    /// Serialized configuration document
    pub content: String,
}
