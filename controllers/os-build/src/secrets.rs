//! Secret canonicalization.
//!
//! Builders only understand registry credentials in the nested
//! `{"auths": {...}}` schema stored under `.dockerconfigjson`. Secrets in the
//! legacy bare schema (either `.dockercfg` or a `.dockerconfigjson` without
//! the `auths` wrapper) are mirrored into a derived `<name>-canonical` secret
//! which the build then uses instead.

use crate::backoff::{retry_on_conflict, ConflictRetry};
use crate::error::ControllerError;
use crate::store::{optional, ClusterStore};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marks secrets created by the canonicalizer
pub const CANONICAL_SECRET_LABEL: &str = "osbuild.microscaler.io/canonical-secret";
/// Name of the secret a canonical secret mirrors
pub const ORIGINAL_SECRET_NAME_LABEL: &str = "osbuild.microscaler.io/original-secret-name";

const CANONICAL_SUFFIX: &str = "-canonical";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKER_CFG_KEY: &str = ".dockercfg";

/// Canonical-to-source indirection, source lookup, then one re-resolution
/// after a lost create race
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Name of the canonical secret derived from `source`
#[must_use]
pub fn canonical_name(source: &str) -> String {
    format!("{source}{CANONICAL_SUFFIX}")
}

fn secret_value<'a>(secret: &'a Secret, key: &str) -> Result<&'a [u8], ControllerError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
        .ok_or_else(|| {
            ControllerError::Validation(format!(
                "secret {} has no {key} key",
                secret.name_any()
            ))
        })
}

fn parse_credentials(secret: &Secret, raw: &[u8]) -> Result<Value, ControllerError> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| {
        ControllerError::Validation(format!(
            "secret {} does not hold valid JSON credentials: {e}",
            secret.name_any()
        ))
    })?;
    if !value.is_object() {
        return Err(ControllerError::Validation(format!(
            "secret {} credentials are not a JSON object",
            secret.name_any()
        )));
    }
    Ok(value)
}

/// Computes the canonical `.dockerconfigjson` payload for `secret`.
///
/// Returns `None` when the secret is already canonical.
pub fn canonicalize(secret: &Secret) -> Result<Option<Vec<u8>>, ControllerError> {
    let legacy = match secret.type_.as_deref() {
        Some(DOCKER_CONFIG_JSON_TYPE) => {
            let value = parse_credentials(secret, secret_value(secret, DOCKER_CONFIG_JSON_KEY)?)?;
            if value.get("auths").is_some() {
                return Ok(None);
            }
            value
        }
        Some(DOCKER_CFG_TYPE) => parse_credentials(secret, secret_value(secret, DOCKER_CFG_KEY)?)?,
        other => {
            return Err(ControllerError::Validation(format!(
                "secret {} has unsupported type {:?}",
                secret.name_any(),
                other.unwrap_or_default()
            )));
        }
    };
    serde_json::to_vec(&json!({ "auths": legacy }))
        .map(Some)
        .map_err(|e| ControllerError::Validation(format!("encoding canonical credentials: {e}")))
}

fn canonical_labels(source: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CANONICAL_SECRET_LABEL.to_string(), "true".to_string()),
        (ORIGINAL_SECRET_NAME_LABEL.to_string(), source.to_string()),
    ])
}

/// The source a canonicalizer-made secret mirrors.
fn mirrored_source(secret: &Secret) -> Option<&str> {
    let labels = secret.labels();
    if labels.get(CANONICAL_SECRET_LABEL).map(String::as_str) != Some("true") {
        return None;
    }
    labels.get(ORIGINAL_SECRET_NAME_LABEL).map(String::as_str)
}

/// True when `existing` already carries `desired`'s type, data and labels.
fn is_current(existing: &Secret, desired: &Secret) -> bool {
    let labels = existing.labels();
    existing.type_ == desired.type_
        && existing.data == desired.data
        && desired
            .labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
}

/// Creates and refreshes canonical secrets.
pub struct SecretCanonicalizer {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    retry: ConflictRetry,
}

impl SecretCanonicalizer {
    #[must_use]
    pub fn new(store: Arc<dyn ClusterStore>, namespace: &str, retry: ConflictRetry) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            retry,
        }
    }

    fn desired(&self, source: &Secret, payload: Vec<u8>) -> Secret {
        let source_name = source.name_any();
        Secret {
            metadata: ObjectMeta {
                name: Some(canonical_name(&source_name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(canonical_labels(&source_name)),
                ..Default::default()
            },
            type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_JSON_KEY.to_string(),
                ByteString(payload),
            )])),
            ..Default::default()
        }
    }

    /// Returns the secret a build should use in place of `name`.
    ///
    /// A secret made by the canonicalizer is resolved through its source so
    /// the copy follows rotations; it is returned as-is once the source is
    /// gone. Other already-canonical secrets are returned unchanged.
    /// Otherwise the canonical secret is created, left alone when current,
    /// or updated.
    pub async fn ensure_canonical(&self, name: &str) -> Result<Secret, ControllerError> {
        let mut lookup = name.to_string();
        let mut fetched = None;
        let mut trace = Vec::with_capacity(MAX_RESOLVE_ATTEMPTS);

        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let source = match fetched.take() {
                Some(source) => source,
                None => self.store.get_secret(&lookup).await?,
            };
            if let Some(original) = mirrored_source(&source) {
                if original != lookup {
                    let Some(found) = optional(self.store.get_secret(original).await)? else {
                        warn!("Source {} of canonical secret {} is gone", original, lookup);
                        return Ok(source);
                    };
                    trace.push(format!("{lookup} -> {original}: canonical copy"));
                    lookup = original.to_string();
                    fetched = Some(found);
                    continue;
                }
            }
            let Some(payload) = canonicalize(&source)? else {
                debug!("Secret {} is already canonical", lookup);
                return Ok(source);
            };
            let desired = self.desired(&source, payload);
            match self.apply(&desired).await {
                Err(e) if e.is_already_exists() => {
                    let canonical = desired.name_any();
                    trace.push(format!("{lookup} -> {canonical}: lost create race"));
                    let winner = self.store.get_secret(&canonical).await?;
                    let Some(original) = winner.labels().get(ORIGINAL_SECRET_NAME_LABEL) else {
                        return Err(ControllerError::Validation(format!(
                            "secret {canonical} exists but is not a canonical secret"
                        )));
                    };
                    lookup = original.clone();
                }
                result => return result,
            }
        }

        Err(ControllerError::Validation(format!(
            "could not resolve canonical secret for {name}: [{}]",
            trace.join(", ")
        )))
    }

    async fn apply(&self, desired: &Secret) -> Result<Secret, ControllerError> {
        let name = desired.name_any();
        let Some(existing) = optional(self.store.get_secret(&name).await)? else {
            let created = self.store.create_secret(desired).await?;
            info!("Created canonical secret {}", name);
            return Ok(created);
        };
        if is_current(&existing, desired) {
            return Ok(existing);
        }

        let store = &*self.store;
        let name = name.as_str();
        let updated = retry_on_conflict(&self.retry, || async move {
            let mut current = store.get_secret(name).await?;
            if is_current(&current, desired) {
                return Ok(current);
            }
            current.type_.clone_from(&desired.type_);
            current.data.clone_from(&desired.data);
            current.labels_mut().extend(desired.labels().clone());
            Ok(store.update_secret(&current).await?)
        })
        .await?;
        info!("Updated canonical secret {}", name);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockClusterStore, StoreError};

    fn secret(name: &str, type_: &str, key: &str, payload: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("os-build".to_string()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(payload.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn legacy(name: &str) -> Secret {
        secret(
            name,
            DOCKER_CFG_TYPE,
            DOCKER_CFG_KEY,
            r#"{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}"#,
        )
    }

    fn canonicalizer(store: &MockClusterStore) -> SecretCanonicalizer {
        SecretCanonicalizer::new(Arc::new(store.clone()), "os-build", ConflictRetry::default())
    }

    fn payload(secret: &Secret) -> Value {
        serde_json::from_slice(secret_value(secret, DOCKER_CONFIG_JSON_KEY).unwrap()).unwrap()
    }

    #[test]
    fn test_canonicalize_wraps_legacy_schemas() {
        let wrapped = canonicalize(&legacy("push")).unwrap().unwrap();
        let value: Value = serde_json::from_slice(&wrapped).unwrap();
        assert_eq!(value["auths"]["registry.example.com"]["auth"], "dXNlcjpwYXNz");

        let bare_json = secret(
            "push",
            DOCKER_CONFIG_JSON_TYPE,
            DOCKER_CONFIG_JSON_KEY,
            r#"{"quay.io":{"auth":"eA=="}}"#,
        );
        assert!(canonicalize(&bare_json).unwrap().is_some());

        let canonical = secret(
            "push",
            DOCKER_CONFIG_JSON_TYPE,
            DOCKER_CONFIG_JSON_KEY,
            r#"{"auths":{"quay.io":{"auth":"eA=="}}}"#,
        );
        assert!(canonicalize(&canonical).unwrap().is_none());
    }

    #[test]
    fn test_canonicalize_rejects_malformed_secrets() {
        let opaque = secret("push", "Opaque", "token", "abc");
        assert!(matches!(canonicalize(&opaque), Err(ControllerError::Validation(_))));

        let garbage = secret("push", DOCKER_CFG_TYPE, DOCKER_CFG_KEY, "not json");
        assert!(matches!(canonicalize(&garbage), Err(ControllerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_ensure_canonical_creates_derived_secret() {
        let store = MockClusterStore::new();
        store.seed(legacy("push"));

        let canonical = canonicalizer(&store).ensure_canonical("push").await.unwrap();

        assert_eq!(canonical.name_any(), "push-canonical");
        assert_eq!(canonical.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
        assert_eq!(
            canonical.labels().get(ORIGINAL_SECRET_NAME_LABEL).map(String::as_str),
            Some("push")
        );
        assert!(payload(&canonical)["auths"]["registry.example.com"].is_object());
    }

    #[tokio::test]
    async fn test_ensure_canonical_is_idempotent() {
        let store = MockClusterStore::new();
        store.seed(legacy("push"));
        let canonicalizer = canonicalizer(&store);

        let first = canonicalizer.ensure_canonical("push").await.unwrap();
        let second = canonicalizer.ensure_canonical("push").await.unwrap();

        assert_eq!(first.data, second.data);
        assert_eq!(store.calls("create_secret"), 1);
        assert_eq!(store.calls("update_secret"), 0);
    }

    #[tokio::test]
    async fn test_ensure_canonical_returns_canonical_source_unchanged() {
        let store = MockClusterStore::new();
        let source = store.seed(secret(
            "push",
            DOCKER_CONFIG_JSON_TYPE,
            DOCKER_CONFIG_JSON_KEY,
            r#"{"auths":{"quay.io":{"auth":"eA=="}}}"#,
        ));

        let resolved = canonicalizer(&store).ensure_canonical("push").await.unwrap();

        assert_eq!(resolved.name_any(), "push");
        assert_eq!(resolved.data, source.data);
        assert_eq!(store.calls("create_secret"), 0);
    }

    #[tokio::test]
    async fn test_ensure_canonical_refreshes_stale_copy() {
        let store = MockClusterStore::new();
        store.seed(legacy("push"));
        let mut stale = secret(
            "push-canonical",
            DOCKER_CONFIG_JSON_TYPE,
            DOCKER_CONFIG_JSON_KEY,
            r#"{"auths":{"old.example.com":{"auth":"eA=="}}}"#,
        );
        stale.metadata.labels = Some(canonical_labels("push"));
        store.seed(stale);

        let refreshed = canonicalizer(&store).ensure_canonical("push").await.unwrap();

        assert_eq!(store.calls("update_secret"), 1);
        assert!(payload(&refreshed)["auths"]["registry.example.com"].is_object());
        assert!(payload(&refreshed)["auths"].get("old.example.com").is_none());
    }

    #[tokio::test]
    async fn test_ensure_canonical_retries_conflicting_update() {
        let store = MockClusterStore::new();
        store.seed(legacy("push"));
        let mut stale = legacy("push-canonical");
        stale.metadata.labels = Some(canonical_labels("push"));
        store.seed(stale);
        store.fail_next("update_secret", StoreError::Conflict("secret/push-canonical".into()));

        let refreshed = canonicalizer(&store).ensure_canonical("push").await.unwrap();

        assert_eq!(store.calls("update_secret"), 2);
        assert_eq!(refreshed.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
    }

    #[tokio::test]
    async fn test_ensure_canonical_follows_rotated_source() {
        let store = MockClusterStore::new();
        store.seed(legacy("push"));
        let canonicalizer = canonicalizer(&store);
        canonicalizer.ensure_canonical("push").await.unwrap();
        store.seed(secret(
            "push",
            DOCKER_CFG_TYPE,
            DOCKER_CFG_KEY,
            r#"{"new.example.com":{"auth":"bmV3OnBhc3M="}}"#,
        ));

        let resolved = canonicalizer.ensure_canonical("push-canonical").await.unwrap();

        assert_eq!(resolved.name_any(), "push-canonical");
        assert_eq!(payload(&resolved)["auths"]["new.example.com"]["auth"], "bmV3OnBhc3M=");
        assert!(payload(&resolved)["auths"].get("registry.example.com").is_none());
        let stored: Secret = store.peek("push-canonical").unwrap();
        assert_eq!(stored.data, resolved.data);
    }

    #[tokio::test]
    async fn test_ensure_canonical_keeps_copy_of_deleted_source() {
        let store = MockClusterStore::new();
        store.seed(legacy("push"));
        let canonicalizer = canonicalizer(&store);
        let canonical = canonicalizer.ensure_canonical("push").await.unwrap();
        store.secrets.lock().unwrap().remove("push");

        let resolved = canonicalizer.ensure_canonical("push-canonical").await.unwrap();

        assert_eq!(resolved.name_any(), "push-canonical");
        assert_eq!(resolved.data, canonical.data);
        assert_eq!(store.calls("update_secret"), 0);
    }

    #[tokio::test]
    async fn test_ensure_canonical_missing_source() {
        let store = MockClusterStore::new();
        let err = canonicalizer(&store).ensure_canonical("absent").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
