//! Image build requests.
//!
//! An [`ImageBuildRequest`] is everything a backend needs to run one build.
//! It is derived from a configuration and a record and never stored; the
//! same inputs always produce the same request.

use crds::{BuildRecord, ImageBuilderKind};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Marks every object created for a single build attempt
pub const EPHEMERAL_LABEL: &str = "osbuild.microscaler.io/ephemeral-build-object";
/// Pool the build is for
pub const TARGET_POOL_LABEL: &str = "osbuild.microscaler.io/target-pool";
/// Rendered configuration the build is for
pub const RENDERED_CONFIG_LABEL: &str = "osbuild.microscaler.io/rendered-config";
/// BuildRecord the build belongs to
pub const BUILD_RECORD_LABEL: &str = "osbuild.microscaler.io/build-record";

/// Key holding the rendered configuration in its content object
pub const RENDERED_CONFIG_KEY: &str = "config.json";
/// Key holding the build script in its content object
pub const CONTAINERFILE_KEY: &str = "Containerfile";
/// Key the backend writes the pushed digest under
pub const DIGEST_KEY: &str = "digest";

/// Optional secret with entitlement keys
pub const ENTITLEMENT_SECRET: &str = "etc-pki-entitlement";
/// Optional secret with RPM signing keys
pub const RPM_GPG_SECRET: &str = "etc-pki-rpm-gpg";
/// Optional ConfigMap with extra package repositories
pub const YUM_REPOS_CONFIG_MAP: &str = "etc-yum-repos-d";

/// Names of the ephemeral objects for one rendered configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    /// Builder object (pod or native build)
    pub build: String,
    /// Content object carrying the rendered configuration
    pub rendered_config: String,
    /// Content object carrying the build script
    pub containerfile: String,
    /// Content object the backend writes the digest to
    pub digest: String,
}

impl ArtifactNames {
    #[must_use]
    pub fn for_rendered_config(rendered: &str) -> Self {
        Self {
            build: format!("build-{rendered}"),
            rendered_config: format!("rendered-config-{rendered}"),
            containerfile: format!("containerfile-{rendered}"),
            digest: format!("digest-{rendered}"),
        }
    }

    /// Names for the record's desired configuration
    #[must_use]
    pub fn for_record(record: &BuildRecord) -> Self {
        Self::for_rendered_config(&record.spec.desired_config.name)
    }
}

/// Presence of the optional build inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionalInputs {
    pub entitlement_keys: bool,
    pub rpm_gpg_keys: bool,
    pub yum_repos: bool,
}

/// Immutable description of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
    pub namespace: String,
    pub pool: String,
    pub record: String,
    pub configuration: String,
    pub rendered_config: String,
    pub builder_type: ImageBuilderKind,
    pub base_image_pullspec: String,
    pub extensions_image_pullspec: String,
    pub release_version: String,
    pub mco_image_pullspec: String,
    pub base_image_pull_secret: Option<String>,
    pub push_secret: String,
    /// Tagged destination for this build
    pub pushspec: String,
    pub containerfile: String,
    pub optional_inputs: OptionalInputs,
    pub artifacts: ArtifactNames,
}

impl ImageBuildRequest {
    /// Labels stamped on every ephemeral object of this build.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (EPHEMERAL_LABEL.to_string(), "true".to_string()),
            (TARGET_POOL_LABEL.to_string(), self.pool.clone()),
            (RENDERED_CONFIG_LABEL.to_string(), self.rendered_config.clone()),
            (BUILD_RECORD_LABEL.to_string(), self.record.clone()),
        ])
    }

    fn config_map(&self, name: &str, key: &str, value: String) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value)])),
            ..Default::default()
        }
    }

    /// Content object carrying the rendered configuration.
    #[must_use]
    pub fn rendered_config_map(&self, content: &str) -> ConfigMap {
        self.config_map(
            &self.artifacts.rendered_config,
            RENDERED_CONFIG_KEY,
            content.to_string(),
        )
    }

    /// Content object carrying the build script.
    #[must_use]
    pub fn containerfile_config_map(&self) -> ConfigMap {
        self.config_map(
            &self.artifacts.containerfile,
            CONTAINERFILE_KEY,
            self.containerfile.clone(),
        )
    }
}

/// Inputs the build script is generated from.
#[derive(Debug, Clone, Copy)]
pub struct ContainerfileInputs<'a> {
    pub pool: &'a str,
    pub rendered_config: &'a str,
    pub base_image: &'a str,
    pub extensions_image: &'a str,
    pub mco_image: &'a str,
    pub release_version: &'a str,
    pub optional_inputs: OptionalInputs,
    pub extra: Option<&'a str>,
}

/// Generates the build script. Output depends only on the inputs.
#[must_use]
pub fn render_containerfile(inputs: &ContainerfileInputs<'_>) -> String {
    let mut lines = vec![
        format!("# Pool: {}", inputs.pool),
        format!("# Rendered config: {}", inputs.rendered_config),
        format!("FROM {} AS extensions", inputs.extensions_image),
        String::new(),
        format!("FROM {} AS configs", inputs.mco_image),
        format!("COPY ./rendered-config/{RENDERED_CONFIG_KEY} /etc/os-build/{RENDERED_CONFIG_KEY}"),
        String::new(),
        format!("FROM {}", inputs.base_image),
    ];
    let optional = inputs.optional_inputs;
    if optional.entitlement_keys {
        lines.push(format!("COPY ./{ENTITLEMENT_SECRET}/ /etc/pki/entitlement/"));
    }
    if optional.rpm_gpg_keys {
        lines.push(format!("COPY ./{RPM_GPG_SECRET}/ /etc/pki/rpm-gpg/"));
    }
    if optional.yum_repos {
        lines.push(format!("COPY ./{YUM_REPOS_CONFIG_MAP}/ /etc/yum.repos.d/"));
    }
    lines.extend([
        "COPY --from=extensions /usr/share/rpm-ostree/extensions/ /usr/share/rpm-ostree/extensions/"
            .to_string(),
        "COPY --from=configs /etc/os-build/ /etc/os-build/".to_string(),
        "RUN --mount=type=bind,from=configs,source=/usr/bin,target=/run/mco \\".to_string(),
        format!(
            "    /run/mco/machine-config-daemon firstboot-complete-machineconfig --machineconfig-file /etc/os-build/{RENDERED_CONFIG_KEY} && \\"
        ),
        "    ostree container commit".to_string(),
        format!("LABEL {TARGET_POOL_LABEL}=\"{}\"", inputs.pool),
        format!("LABEL {RENDERED_CONFIG_LABEL}=\"{}\"", inputs.rendered_config),
        format!(
            "LABEL osbuild.microscaler.io/release-version=\"{}\"",
            inputs.release_version
        ),
    ]);
    if let Some(extra) = inputs.extra.filter(|e| !e.trim().is_empty()) {
        lines.push(String::new());
        lines.push(extra.trim_end().to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Deterministic BuildRecord name for a pool and rendered configuration.
#[must_use]
pub fn build_record_name(pool: &str, rendered: &str) -> String {
    format!("{pool}-{rendered}-builder")
}

/// Name of the configuration that owns `record`.
#[must_use]
pub fn owner_name(record: &BuildRecord) -> &str {
    &record.spec.build_configuration.name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(optional_inputs: OptionalInputs, extra: Option<&str>) -> ContainerfileInputs<'_> {
        ContainerfileInputs {
            pool: "worker",
            rendered_config: "rendered-worker-1",
            base_image: "quay.io/os/base:9",
            extensions_image: "quay.io/os/extensions:9",
            mco_image: "quay.io/os/mco:4",
            release_version: "4.16.0",
            optional_inputs,
            extra,
        }
    }

    #[test]
    fn test_artifact_names_follow_rendered_config() {
        let names = ArtifactNames::for_rendered_config("rendered-worker-1");

        assert_eq!(names.build, "build-rendered-worker-1");
        assert_eq!(names.rendered_config, "rendered-config-rendered-worker-1");
        assert_eq!(names.containerfile, "containerfile-rendered-worker-1");
        assert_eq!(names.digest, "digest-rendered-worker-1");
        assert_eq!(build_record_name("worker", "rendered-worker-1"), "worker-rendered-worker-1-builder");
    }

    #[test]
    fn test_containerfile_is_deterministic() {
        let a = render_containerfile(&inputs(OptionalInputs::default(), None));
        let b = render_containerfile(&inputs(OptionalInputs::default(), None));
        assert_eq!(a, b);
        assert!(a.contains("FROM quay.io/os/base:9"));
        assert!(!a.contains("/etc/pki/entitlement/"));
    }

    #[test]
    fn test_containerfile_includes_optional_inputs_and_extra() {
        let all = OptionalInputs {
            entitlement_keys: true,
            rpm_gpg_keys: true,
            yum_repos: true,
        };
        let out = render_containerfile(&inputs(all, Some("RUN rpm-ostree install tmux\n")));

        assert!(out.contains("COPY ./etc-pki-entitlement/ /etc/pki/entitlement/"));
        assert!(out.contains("COPY ./etc-pki-rpm-gpg/ /etc/pki/rpm-gpg/"));
        assert!(out.contains("COPY ./etc-yum-repos-d/ /etc/yum.repos.d/"));
        assert!(out.trim_end().ends_with("RUN rpm-ostree install tmux"));
    }
}
