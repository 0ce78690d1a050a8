//! Controller-specific error types.
//!
//! This module defines error types specific to the WebPage Controller
//! that are not covered by upstream library errors.

use cluster_store::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the WebPage Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Object store error outside of a dependent apply (fetch, cleanup)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Desired state could not be built (missing owner identity)
    #[error("Failed to build desired state: {0}")]
    Build(String),

    /// Applying a dependent object failed
    #[error("Failed to apply {kind} {name}: {source}")]
    Apply {
        kind: &'static str,
        name: String,
        #[source]
        source: StoreError,
    },

    /// A store call did not finish before the pass deadline
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe/metrics server failed
    #[error("Probe server failed: {0}")]
    Server(String),
}

impl ControllerError {
    /// Whether the error class may resolve without a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) | Self::Apply { source: e, .. } => e.is_retryable(),
            Self::DeadlineExceeded(_) | Self::Kube(_) | Self::Watch(_) => true,
            Self::Build(_) | Self::InvalidConfig(_) | Self::Server(_) => false,
        }
    }

    /// Short label used for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Build(_) => "build",
            Self::Apply { .. } => "apply",
            Self::DeadlineExceeded(_) => "deadline",
            Self::InvalidConfig(_) => "config",
            Self::Kube(_) => "kube",
            Self::Watch(_) => "watch",
            Self::Server(_) => "server",
        }
    }
}
