//! Deduplicating, rate-limited work queue.
//!
//! A key is in at most one of three places: queued, being processed, or both
//! "processing and dirty" when it was re-added while a worker held it. In the
//! last case it goes back on the queue only when the worker calls
//! [`WorkQueue::done`], so a key is never handed to two workers at once.

use crate::backoff::ItemBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// What a queued key refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    /// A BuildConfiguration or BuildRecord, resolved record-first
    Build(String),
    /// A pool whose desired configuration needs a build
    PoolBuild(String),
    /// A pool that left layered builds
    PoolOptOut(String),
    /// Builder object with a reported phase change waiting to be applied
    Observe(String),
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKey::Build(name) => write!(f, "build/{name}"),
            QueueKey::PoolBuild(name) => write!(f, "pool-build/{name}"),
            QueueKey::PoolOptOut(name) => write!(f, "pool-opt-out/{name}"),
            QueueKey::Observe(name) => write!(f, "observe/{name}"),
        }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Work queue shared by the event router and the workers.
///
/// Failed keys come back through [`WorkQueue::add_rate_limited`], delayed by
/// [`ItemBackoff`] for the number of failures since the key was last
/// [`forgotten`](WorkQueue::forget). Workers give up on a key after
/// `MAX_RETRIES` such requeues: the failure count is cleared and the key is
/// re-added once the cool-down (60s by default) has passed, so no key is
/// ever dropped while its object still exists.
///
/// # Example
///
/// ```ignore
/// let queue = WorkQueue::new(ItemBackoff::default());
/// queue.add(QueueKey::Build("worker-build".into()));
/// while let Some(key) = queue.get().await {
///     match reconcile(&key).await {
///         Ok(()) => queue.forget(&key),
///         Err(_) => queue.add_rate_limited(key.clone()),
///     }
///     queue.done(&key);
/// }
/// ```
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    ready: Notify,
    idle: Notify,
    backoff: ItemBackoff,
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + fmt::Debug + 'static,
{
    /// Create an empty queue using `backoff` for rate-limited adds.
    #[must_use]
    pub fn new(backoff: ItemBackoff) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            idle: Notify::new(),
            backoff,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing. Adding a key that is already
    /// queued is a no-op.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            trace!("{:?} is being processed, deferring", key);
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.ready.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.lock().shutting_down {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds `key` after its per-item backoff and counts the failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay_for(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the failure count for `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// How many rate-limited adds `key` has had since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down
    /// and empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as finished. If it was re-added meanwhile, it is queued again.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty() && state.queue.is_empty();
        drop(state);
        if requeue {
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Stops accepting keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.ready.notify_waiters();
    }

    /// Stops accepting keys and waits until every queued and in-flight key
    /// has been processed.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.processing.is_empty() && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Number of keys waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(ItemBackoff::default())
    }

    #[tokio::test]
    async fn test_add_deduplicates_queued_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_readded_while_processing_waits_for_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rate_limited_adds_count_failures() {
        let q = queue();
        let key = "a".to_string();

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_returns_none() {
        let q = queue();
        q.add("a".to_string());
        q.shut_down();
        q.add("b".to_string());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_with_drain_waits_for_in_flight_keys() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        let drained = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.shut_down_with_drain().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drained.is_finished());

        q.done(&key);
        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_processed_concurrently() {
        let q = queue();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let processed = Arc::new(AtomicUsize::new(0));

        for round in 0..5 {
            for i in 0..10 {
                q.add(format!("record-{i}"));
            }
            if round % 2 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut workers = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let in_flight = Arc::clone(&in_flight);
            let processed = Arc::clone(&processed);
            workers.push(tokio::spawn(async move {
                while let Some(key) = q.get().await {
                    assert!(
                        in_flight.lock().unwrap().insert(key.clone()),
                        "{key} handed to two workers"
                    );
                    // Re-adding mid-flight must not release a second copy
                    q.add(key.clone());
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.lock().unwrap().remove(&key);
                    processed.fetch_add(1, Ordering::SeqCst);
                    q.done(&key);
                    if processed.load(Ordering::SeqCst) >= 40 {
                        q.shut_down();
                    }
                }
            }));
        }

        for worker in workers {
            tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(processed.load(Ordering::SeqCst) >= 40);
    }
}
