//! Controller-specific error types.
//!
//! `StoreError` and `BuilderError` come from the cluster store and the build
//! backends; `ControllerError` is what reconciliation returns to the work
//! queue.

use crate::store::StoreError;
use thiserror::Error;

/// Errors raised by a build backend.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The backend rejected the request
    #[error("Build backend error: {0}")]
    Backend(String),
}

/// Errors that can occur in the OS Build Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Build backend error
    #[error("Builder error: {0}")]
    Builder(#[from] BuilderError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed input that retrying cannot fix
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A lifecycle transition the state machine does not allow
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Several independent operations failed
    #[error("{} errors occurred: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<ControllerError>),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ControllerError {
    /// Collapses a list of failures: none is `Ok`, one is returned as is.
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Result<(), ControllerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Aggregate(errors)),
        }
    }

    /// True when the error is an optimistic-concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Store(e) | ControllerError::Builder(BuilderError::Store(e)) => {
                e.is_conflict()
            }
            ControllerError::Kube(kube::Error::Api(ae))
            | ControllerError::Builder(BuilderError::Kube(kube::Error::Api(ae))) => ae.code == 409,
            _ => false,
        }
    }

    /// True when the error means the target object does not exist.
    ///
    /// An aggregate counts as not-found only if every member is.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::Store(e) | ControllerError::Builder(BuilderError::Store(e)) => {
                e.is_not_found()
            }
            ControllerError::Kube(kube::Error::Api(ae))
            | ControllerError::Builder(BuilderError::Kube(kube::Error::Api(ae))) => ae.code == 404,
            ControllerError::Aggregate(errors) => errors.iter().all(ControllerError::is_not_found),
            _ => false,
        }
    }

    /// True when a create lost to an existing object of the same name.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            ControllerError::Store(e) | ControllerError::Builder(BuilderError::Store(e)) => {
                e.is_already_exists()
            }
            ControllerError::Kube(kube::Error::Api(ae))
            | ControllerError::Builder(BuilderError::Kube(kube::Error::Api(ae))) => {
                ae.code == 409 && ae.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Whether retrying the reconciliation can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ControllerError::Validation(_)
                | ControllerError::InvalidTransition { .. }
                | ControllerError::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_collapses_small_lists() {
        assert!(ControllerError::aggregate(Vec::new()).is_ok());

        let single = ControllerError::aggregate(vec![ControllerError::Validation("x".into())]);
        assert!(matches!(single, Err(ControllerError::Validation(_))));

        let many = ControllerError::aggregate(vec![
            ControllerError::Validation("a".into()),
            ControllerError::Watch("b".into()),
        ]);
        match many {
            Err(ControllerError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_message_lists_every_error() {
        let err = ControllerError::Aggregate(vec![
            ControllerError::Validation("bad digest".into()),
            ControllerError::Watch("stream closed".into()),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 errors occurred"));
        assert!(message.contains("bad digest"));
        assert!(message.contains("stream closed"));
    }

    #[test]
    fn test_classifiers() {
        let not_found = ControllerError::Store(StoreError::NotFound("secret/x".into()));
        let conflict = ControllerError::Store(StoreError::Conflict("record/y".into()));

        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());
        assert!(conflict.is_conflict());
        assert!(ControllerError::Aggregate(vec![not_found]).is_not_found());
        assert!(!ControllerError::Validation("v".into()).is_retryable());
        assert!(conflict.is_retryable());
    }
}
