//! WebPage Controller
//!
//! Serves static HTML pages declared as `WebPage` custom resources.
//!
//! For every WebPage this controller keeps a ConfigMap holding the page
//! contents and an nginx Deployment mounting it, both owned by the WebPage,
//! and records the time of the last successful pass in the WebPage status.

mod backoff;
mod config;
mod controller;
mod desired;
mod error;
mod reconciler;
mod telemetry;
mod watcher;

#[cfg(test)]
mod reconciler_test;
#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting WebPage Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Dependent policy: {:?}", config.reconciler.dependent_policy);
    info!("  Cascade mode: {:?}", config.reconciler.cascade_mode);
    info!("  Image: {}", config.reconciler.image);
    info!("  Reconcile timeout: {}s", config.reconcile_timeout.as_secs());
    info!("  Probe address: {}", config.probe_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
