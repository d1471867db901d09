//! NodePool CRD
//!
//! A group of nodes sharing one rendered configuration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label opting a pool into layered image builds
pub const LAYERING_ENABLED_LABEL: &str = "osbuild.microscaler.io/layering-enabled";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "NodePool",
    shortname = "np",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Desired rendered configuration for the pool
    pub configuration: PoolConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfiguration {
    /// Name of the RenderedConfig the pool should run
    pub name: String,

    /// Objects that contributed to this configuration
    #[serde(default)]
    pub source: Vec<ConfigurationSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSource {
    pub api_version: String,

    pub kind: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl NodePool {
    /// Whether the pool carries the layering opt-in label.
    #[must_use]
    pub fn layering_enabled(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LAYERING_ENABLED_LABEL))
            .is_some_and(|value| value == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pool_with_labels(labels: Option<BTreeMap<String, String>>) -> NodePool {
        NodePool {
            metadata: ObjectMeta {
                name: Some("worker".to_string()),
                labels,
                ..Default::default()
            },
            spec: NodePoolSpec::default(),
        }
    }

    #[test]
    fn test_layering_enabled_requires_true_label() {
        let enabled = BTreeMap::from([(LAYERING_ENABLED_LABEL.to_string(), "true".to_string())]);
        let disabled = BTreeMap::from([(LAYERING_ENABLED_LABEL.to_string(), "false".to_string())]);

        assert!(pool_with_labels(Some(enabled)).layering_enabled());
        assert!(!pool_with_labels(Some(disabled)).layering_enabled());
        assert!(!pool_with_labels(None).layering_enabled());
    }
}
