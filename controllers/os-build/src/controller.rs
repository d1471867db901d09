//! Main controller implementation.
//!
//! The `Controller` wires the event router, the work-queue workers, the
//! build backend's own loop and the health server together, and runs them
//! until shutdown.

use crate::builder::{BuildObserver, BuilderRunContext, ImageBuilder};
use crate::config::ControllerConfig;
use crate::error::{BuilderError, ControllerError};
use crate::health::{self, HealthState};
use crate::metrics::Metrics;
use crate::reconciler::{Context, Reconciler};
use crate::store::ClusterStore;
use crate::watcher::{Caches, Watcher};
use crate::workqueue::{QueueKey, WorkQueue};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decides what happens to `key` after a sync attempt.
///
/// Successes and errors that cannot be fixed by retrying clear the key's
/// backoff. Other errors requeue with backoff until `max_retries`, after
/// which the key is parked for `cool_down`.
pub(crate) fn handle_err(
    queue: &Arc<WorkQueue<QueueKey>>,
    key: &QueueKey,
    result: Result<(), ControllerError>,
    max_retries: u32,
    cool_down: Duration,
) {
    let Err(e) = result else {
        queue.forget(key);
        return;
    };
    if !e.is_retryable() {
        error!("Dropping {} after non-retryable error: {}", key, e);
        queue.forget(key);
        return;
    }
    let requeues = queue.num_requeues(key);
    if requeues < max_retries {
        warn!("Error syncing {} (attempt {}): {}", key, requeues + 1, e);
        queue.add_rate_limited(key.clone());
        return;
    }
    error!(
        "Giving up on {} after {} retries, retrying in {:?}: {}",
        key, requeues, cool_down, e
    );
    queue.forget(key);
    queue.add_after(key.clone(), cool_down);
}

async fn run_worker(id: usize, reconciler: Arc<Reconciler>) {
    let ctx = reconciler.context().clone();
    debug!("Worker {} started", id);
    while let Some(key) = ctx.queue.get().await {
        ctx.metrics
            .queue_depth
            .set(i64::try_from(ctx.queue.len()).unwrap_or(i64::MAX));
        let result = reconciler.sync(&key).await;
        handle_err(
            &ctx.queue,
            &key,
            result,
            ctx.config.max_retries,
            ctx.config.cool_down,
        );
        ctx.queue.done(&key);
    }
    debug!("Worker {} stopped", id);
}

/// Main controller for OS image builds.
pub struct Controller {
    client: Client,
    config: ControllerConfig,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
}

impl Controller {
    /// Creates a new controller instance.
    #[must_use]
    pub fn new(
        client: Client,
        store: Arc<dyn ClusterStore>,
        builder: Arc<dyn ImageBuilder>,
        config: ControllerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        info!("Initializing OS Build Controller");
        let queue = WorkQueue::new(config.item_backoff);
        let reconciler = Arc::new(Reconciler::new(Context {
            store,
            builder,
            queue,
            config: config.clone(),
            metrics: Arc::clone(&metrics),
        }));
        Self {
            client,
            config,
            reconciler,
            metrics,
        }
    }

    /// Runs the controller until `shutdown` is cancelled or a watch fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let ctx = self.reconciler.context().clone();
        let health_state = HealthState::new(Arc::clone(&self.metrics));
        let health: JoinHandle<()> = tokio::spawn(health::serve(
            self.config.health_addr,
            health_state.clone(),
            shutdown.clone(),
        ));

        let (caches, writers) = Caches::new();
        let watcher = Arc::new(Watcher::new(
            self.client.clone(),
            &self.config.namespace,
            Arc::clone(&ctx.queue),
            Arc::clone(&self.reconciler),
            caches.clone(),
        ));
        let mut watch: JoinHandle<Result<(), ControllerError>> = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.run(writers).await })
        };

        info!("Waiting for caches to sync");
        tokio::select! {
            synced = caches.wait_until_ready() => synced?,
            result = &mut watch => {
                return Err(watch_exit(result));
            }
            () = shutdown.cancelled() => {
                watch.abort();
                return Ok(());
            }
        }
        info!("Caches synced");
        health_state.set_ready();

        let mut backend: JoinHandle<Result<(), BuilderError>> = {
            let builder = Arc::clone(&ctx.builder);
            let run_ctx = BuilderRunContext {
                shutdown: shutdown.clone(),
                observer: Arc::clone(&self.reconciler) as Arc<dyn BuildObserver>,
            };
            let workers = self.config.workers;
            tokio::spawn(async move { builder.run(run_ctx, workers).await })
        };

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&self.reconciler))))
            .collect();
        info!(
            "OS Build Controller running with {} workers",
            self.config.workers
        );

        let outcome = tokio::select! {
            result = &mut watch => Err(watch_exit(result)),
            result = &mut backend => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ControllerError::Builder(e)),
                Err(e) => Err(ControllerError::Watch(format!("image builder panicked: {e}"))),
            },
            () = shutdown.cancelled() => Ok(()),
        };

        info!("Shutting down, draining work queue");
        shutdown.cancel();
        ctx.queue.shut_down_with_drain().await;
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        watch.abort();
        backend.abort();
        if let Err(e) = health.await {
            warn!("Health server exited abnormally: {}", e);
        }
        info!("OS Build Controller stopped");
        outcome
    }
}

fn watch_exit(
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> ControllerError {
    match result {
        Ok(Ok(())) => ControllerError::Watch("watchers exited".to_string()),
        Ok(Err(e)) => e,
        Err(e) => ControllerError::Watch(format!("watcher panicked: {e}")),
    }
}
