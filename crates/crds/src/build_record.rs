//! BuildRecord CRD
//!
//! One attempt to build an image for a specific rendered configuration.
//! The name is derived from the pool and the rendered configuration so at
//! most one record exists per desired configuration.

use crate::build_configuration::ImageBuilderKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "BuildRecord",
    status = "BuildRecordStatus",
    shortname = "obr"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecordSpec {
    /// Owning BuildConfiguration
    pub build_configuration: ObjectName,

    /// Rendered configuration this attempt builds
    pub desired_config: ObjectName,

    /// Tagged pushspec for this attempt
    pub rendered_image_pushspec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectName {
    /// Object name
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecordStatus {
    /// Lifecycle conditions, exactly one of which is true once claimed
    #[serde(default)]
    pub conditions: Vec<BuildCondition>,

    /// Builder object driving this attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_reference: Option<BuilderReference>,

    /// Digest-qualified pullspec once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_image_pushspec: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_start: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_end: Option<chrono::DateTime<chrono::Utc>>,

    /// Last error raised while starting a build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildCondition {
    #[serde(rename = "type")]
    pub condition_type: BuildConditionType,

    pub status: ConditionStatus,

    pub reason: String,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Lifecycle condition types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum BuildConditionType {
    Prepared,
    Building,
    Failed,
    Interrupted,
    Succeeded,
}

impl BuildConditionType {
    /// All condition types in rendering order.
    pub const ALL: [Self; 5] = [
        Self::Prepared,
        Self::Building,
        Self::Failed,
        Self::Interrupted,
        Self::Succeeded,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    #[default]
    False,
    Unknown,
}

/// Reference to the backend object executing a build
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuilderReference {
    pub image_builder_type: ImageBuilderKind,

    pub kind: String,

    pub name: String,

    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}
