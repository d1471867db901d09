//! Controller configuration.
//!
//! Process settings come from environment variables. The build backend is
//! selected separately from a ConfigMap in the controller namespace, see
//! [`crate::builder::select_builder_type`].

use crate::backoff::{ConflictRetry, ItemBackoff};
use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// ConfigMap holding the backend selection
pub const BUILDER_CONFIG_MAP: &str = "os-build-config";

/// Key in [`BUILDER_CONFIG_MAP`] naming the backend
pub const BUILDER_TYPE_KEY: &str = "imageBuilderType";

/// Runtime settings shared by every component.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace holding secrets, content objects and build pods
    pub namespace: String,
    /// Number of reconciliation workers
    pub workers: usize,
    /// Requeues with backoff before a key is parked for the cool-down
    pub max_retries: u32,
    /// Delay before re-checking an interrupted build that is still running
    pub update_delay: Duration,
    /// Delay before a key that exhausted its retries is tried again
    pub cool_down: Duration,
    /// Work-queue backoff
    pub item_backoff: ItemBackoff,
    /// Retry policy for conflicting writes
    pub conflict_retry: ConflictRetry,
    /// Address for health and metrics endpoints
    pub health_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "os-build".to_string(),
            workers: 5,
            max_retries: 5,
            update_delay: Duration::from_secs(5),
            cool_down: Duration::from_secs(60),
            item_backoff: ItemBackoff::default(),
            conflict_retry: ConflictRetry::default(),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Unset keys keep
    /// their defaults; set but unparsable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(namespace) = lookup("CONTROLLER_NAMESPACE").filter(|ns| !ns.is_empty()) {
            config.namespace = namespace;
        }
        if let Some(workers) = parse_var::<usize>(&lookup, "WORKERS")? {
            if workers == 0 {
                return Err(ControllerError::InvalidConfig(
                    "WORKERS must be at least 1".to_string(),
                ));
            }
            config.workers = workers;
        }
        if let Some(max_retries) = parse_var(&lookup, "MAX_RETRIES")? {
            config.max_retries = max_retries;
        }
        if let Some(secs) = parse_var(&lookup, "UPDATE_DELAY_SECS")? {
            config.update_delay = Duration::from_secs(secs);
        }
        if let Some(addr) = parse_var(&lookup, "HEALTH_ADDR")? {
            config.health_addr = addr;
        }

        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                ControllerError::InvalidConfig(format!("{key}={raw:?} is invalid: {e}"))
            })
        })
        .transpose()
}
