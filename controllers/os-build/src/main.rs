//! OS Build Controller
//!
//! Builds layered OS images for node pools. For every pool that opts into
//! layered builds, the controller turns the pool's rendered configuration
//! into a container image, pushes it to the configured registry and
//! publishes the digest-qualified pullspec back on the BuildConfiguration.

mod assembler;
mod backoff;
mod builder;
mod cleanup;
mod config;
mod controller;
mod error;
mod health;
mod image_ref;
mod lifecycle;
mod metrics;
mod pod_watcher;
mod reconciler;
mod request;
mod secrets;
mod store;
mod watcher;
mod workqueue;

#[cfg(test)]
mod test_utils;

use crate::builder::native::NativeImageBuilder;
use crate::builder::pod::PodImageBuilder;
use crate::builder::{select_builder_type, ImageBuilder};
use crate::config::{ControllerConfig, BUILDER_CONFIG_MAP};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::store::{ClusterStore, KubeClusterStore};
use controller::Controller;
use crds::ImageBuilderKind;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls transport needs a process-wide provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting OS Build Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Workers: {}", config.workers);
    info!("  Health address: {}", config.health_addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let client = Client::try_default().await?;
    let store: Arc<dyn ClusterStore> =
        Arc::new(KubeClusterStore::new(client.clone(), &config.namespace));

    let Some(kind) = select_builder_type(store.as_ref()).await? else {
        warn!(
            "ConfigMap {}/{} not found, idling until it is created and the controller restarts",
            config.namespace, BUILDER_CONFIG_MAP
        );
        shutdown.cancelled().await;
        return Ok(());
    };
    info!("  Image builder: {:?}", kind);

    let builder: Arc<dyn ImageBuilder> = match kind {
        ImageBuilderKind::PodImageBuilder => Arc::new(PodImageBuilder::new(Arc::clone(&store))),
        ImageBuilderKind::NativeImageBuilder => Arc::new(NativeImageBuilder::new(
            client.clone(),
            Arc::clone(&store),
            &config.namespace,
        )),
    };
    let metrics = Arc::new(Metrics::new()?);

    let controller = Controller::new(client, store, builder, config, metrics);
    controller.run(shutdown).await?;

    Ok(())
}
