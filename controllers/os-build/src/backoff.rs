//! # Retry Backoff
//!
//! Two retry schedules are used by the controller:
//!
//! - [`ItemBackoff`] spaces out work-queue requeues for a failing key. The delay
//!   doubles with every failure: 5ms, 10ms, 20ms, ... capped at 1000s.
//! - [`ConflictRetry`] bounds the read-modify-write loops that race with other
//!   writers on the same object. It retries only optimistic-concurrency
//!   conflicts and gives up after a fixed number of attempts.

use crate::error::ControllerError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Per-item exponential backoff calculator
///
/// Stateless: the caller tracks how many times an item has failed and asks
/// for the matching delay.
#[derive(Debug, Clone, Copy)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl ItemBackoff {
    /// Create a backoff starting at `base` and never exceeding `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `failures` previous failures.
    ///
    /// The sequence is `base * 2^failures`, capped at `max`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        // 2^31 already overflows any sane base; clamp the exponent first
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Bounded retry policy for optimistic-concurrency conflicts
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetry {
    /// Total attempts, including the first
    pub steps: u32,
    /// Delay before the first retry
    pub duration: Duration,
    /// Multiplier applied to the delay after every retry
    pub factor: u32,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            steps: 5,
            duration: Duration::from_millis(10),
            factor: 1,
        }
    }
}

impl ConflictRetry {
    /// Delays slept between attempts, `steps - 1` of them.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.steps.saturating_sub(1)).map(move |i| {
            self.duration
                .saturating_mul(self.factor.saturating_pow(i))
        })
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or the
/// policy runs out of attempts. The last conflict is returned in that case.
///
/// `op` must re-read whatever it is about to write on every call.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &ConflictRetry,
    mut op: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut delays = policy.delays();
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() => match delays.next() {
                Some(delay) => {
                    debug!("Conflict on attempt {}, retrying in {:?}: {}", attempt, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_item_backoff_sequence() {
        let backoff = ItemBackoff::default();

        assert_eq!(backoff.delay_for(0), Duration::from_millis(5));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(80));
    }

    #[test]
    fn test_item_backoff_max_cap() {
        let backoff = ItemBackoff::default();

        // 5ms * 2^18 is roughly 1310s, past the cap
        assert_eq!(backoff.delay_for(18), Duration::from_secs(1000));
        assert_eq!(backoff.delay_for(31), Duration::from_secs(1000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[test]
    fn test_conflict_retry_default_delays() {
        let policy = ConflictRetry::default();
        let delays: Vec<_> = policy.delays().collect();

        assert_eq!(delays, vec![Duration::from_millis(10); 4]);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_on_conflict(&ConflictRetry::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ControllerError::Store(StoreError::Conflict("record/a".into())))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.ok(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_is_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_on_conflict(&ConflictRetry::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ControllerError::Store(StoreError::Conflict("record/a".into())))
        })
        .await;

        assert!(result.is_err_and(|e| e.is_conflict()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_passes_other_errors_through() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_on_conflict(&ConflictRetry::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ControllerError::Validation("bad".into()))
        })
        .await;

        assert!(matches!(result, Err(ControllerError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
