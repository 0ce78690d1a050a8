//! ObjectStore trait for mocking
//!
//! This trait abstracts the declarative store so the reconciler can run
//! against the Kubernetes API in production and an in-memory store in tests.

use crate::error::StoreError;
use crate::models::ObjectKey;
use crds::{WebPage, WebPageStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;

/// Store operations used by the WebPage reconciler.
///
/// `get_*` return `Ok(None)` for objects that do not exist. `apply_*` are
/// declarative upserts: the object is created if absent, otherwise the
/// fields present in the submitted object replace the stored ones while
/// store-managed metadata is kept.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    // WebPage (parent)
    async fn get_webpage(&self, key: &ObjectKey) -> Result<Option<WebPage>, StoreError>;
    async fn update_webpage_status(
        &self,
        key: &ObjectKey,
        status: &WebPageStatus,
    ) -> Result<WebPage, StoreError>;
    /// Replaces the finalizer list, guarded by the page's resourceVersion.
    async fn set_webpage_finalizers(
        &self,
        page: &WebPage,
        finalizers: Vec<String>,
    ) -> Result<WebPage, StoreError>;

    // ConfigMap (content object)
    async fn get_config_map(&self, key: &ObjectKey) -> Result<Option<ConfigMap>, StoreError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;
    async fn delete_config_map(&self, key: &ObjectKey) -> Result<(), StoreError>;

    // Deployment (workload object)
    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>, StoreError>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;
    async fn delete_deployment(&self, key: &ObjectKey) -> Result<(), StoreError>;
}
