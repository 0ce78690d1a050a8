//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Kubernetes
//! client, reconciler, watcher and probe endpoint together.

use crate::backoff::RetryTracker;
use crate::config::ControllerConfig;
use crate::desired::FIELD_MANAGER;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::telemetry::{self, Metrics, ProbeState};
use crate::watcher::{Context, Watcher};
use cluster_store::KubeStore;
use kube::Client;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for WebPage management.
#[derive(Debug)]
pub struct Controller {
    watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing WebPage Controller");

        let kube_client = Client::try_default().await?;

        let store = KubeStore::new(kube_client.clone(), FIELD_MANAGER);
        let reconciler = Reconciler::new(store, config.reconciler.clone());

        let metrics = Metrics::new()
            .map_err(|e| ControllerError::Server(format!("failed to register metrics: {e}")))?;
        let metrics = Arc::new(metrics);
        let ready = Arc::new(AtomicBool::new(false));

        let context = Arc::new(Context {
            reconciler,
            retries: RetryTracker::default(),
            metrics: Arc::clone(&metrics),
            reconcile_timeout: config.reconcile_timeout,
        });
        let watcher_instance = Watcher::new(kube_client, &config, context, Arc::clone(&ready));

        let probe_server = tokio::spawn(telemetry::serve(
            config.probe_addr,
            ProbeState::new(metrics, ready),
        ));
        let watcher = tokio::spawn(async move { watcher_instance.run().await });

        Ok(Self {
            watcher,
            probe_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("WebPage Controller running");

        // The watcher exits on SIGTERM/SIGINT; the probe server only on error
        tokio::select! {
            result = &mut self.watcher => {
                self.probe_server.abort();
                result.map_err(|e| ControllerError::Watch(format!("watcher panicked: {e}")))??;
            }
            result = &mut self.probe_server => {
                self.watcher.abort();
                result.map_err(|e| ControllerError::Server(format!("probe panicked: {e}")))??;
            }
        }

        info!("WebPage Controller stopped");
        Ok(())
    }
}
