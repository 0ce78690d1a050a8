//! Mock ObjectStore for unit testing
//!
//! This module provides an in-memory implementation of `ObjectStore` that can
//! be used in unit tests without a running API server. Failures and latency
//! can be injected per operation, and every call is recorded so tests can
//! assert which writes a reconciliation pass performed.

use crate::error::StoreError;
use crate::models::ObjectKey;
use crate::store_trait::ObjectStore;
use chrono::{SecondsFormat, Utc};
use crds::{WebPage, WebPageStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Store operations, as recorded by [`MockObjectStore::calls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetWebPage,
    UpdateWebPageStatus,
    SetWebPageFinalizers,
    GetConfigMap,
    CreateConfigMap,
    ApplyConfigMap,
    DeleteConfigMap,
    GetDeployment,
    CreateDeployment,
    ApplyDeployment,
    DeleteDeployment,
}

impl Operation {
    /// Whether the operation mutates the store.
    pub fn is_write(self) -> bool {
        !matches!(self, Self::GetWebPage | Self::GetConfigMap | Self::GetDeployment)
    }
}

/// Error class returned by an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    NotFound,
    Conflict,
    Transient,
    Fatal,
}

impl InjectedFailure {
    fn to_error(self, op: Operation) -> StoreError {
        let message = format!("injected failure for {op:?}");
        match self {
            Self::NotFound => StoreError::NotFound(message),
            Self::Conflict => StoreError::Conflict(message),
            Self::Transient => StoreError::Transient(message),
            Self::Fatal => StoreError::Fatal(message),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_time() -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    ))
    .ok()
}

/// In-memory object store for testing
#[derive(Debug, Clone, Default)]
pub struct MockObjectStore {
    webpages: Arc<Mutex<HashMap<ObjectKey, WebPage>>>,
    config_maps: Arc<Mutex<HashMap<ObjectKey, ConfigMap>>>,
    deployments: Arc<Mutex<HashMap<ObjectKey, Deployment>>>,
    failures: Arc<Mutex<HashMap<Operation, InjectedFailure>>>,
    calls: Arc<Mutex<Vec<Operation>>>,
    latency: Arc<Mutex<Option<Duration>>>,
    op_latency: Arc<Mutex<HashMap<Operation, Duration>>>,
    resource_version: Arc<AtomicU64>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Stamp store-managed metadata onto `meta`, keeping identity from `existing`.
    fn stamp(&self, meta: &mut ObjectMeta, existing: Option<&ObjectMeta>) {
        meta.uid = existing
            .and_then(|e| e.uid.clone())
            .or_else(|| Some(uuid::Uuid::new_v4().to_string()));
        meta.resource_version = Some(self.next_version());
        meta.managed_fields = None;
    }

    // Test setup and inspection

    /// Store a WebPage as if a user had created it. A UID is assigned when absent.
    pub fn insert_webpage(&self, mut page: WebPage) -> WebPage {
        let key = ObjectKey::of(&page).unwrap_or_else(|| ObjectKey::new("default", "unnamed"));
        let uid = page.metadata.uid.take();
        self.stamp(&mut page.metadata, None);
        if uid.is_some() {
            page.metadata.uid = uid;
        }
        lock(&self.webpages).insert(key, page.clone());
        page
    }

    /// Delete a WebPage the way the API server does: objects with finalizers
    /// only get a deletion timestamp.
    pub fn delete_webpage(&self, key: &ObjectKey) {
        let mut pages = lock(&self.webpages);
        let has_finalizers = pages
            .get(key)
            .and_then(|p| p.metadata.finalizers.as_ref())
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if let Some(page) = pages.get_mut(key) {
                page.metadata.deletion_timestamp = now_time();
                page.metadata.resource_version = Some(self.next_version());
            }
        } else {
            pages.remove(key);
        }
    }

    /// Store a WebPage exactly as given, without assigning identity metadata.
    pub fn put_webpage(&self, key: &ObjectKey, page: WebPage) {
        lock(&self.webpages).insert(key.clone(), page);
    }

    /// Overwrite a stored WebPage's spec, bumping its resourceVersion.
    pub fn update_webpage_spec(&self, key: &ObjectKey, html: impl Into<String>) {
        if let Some(page) = lock(&self.webpages).get_mut(key) {
            page.spec.html = html.into();
            page.metadata.resource_version = Some(self.next_version());
        }
    }

    pub fn webpage(&self, key: &ObjectKey) -> Option<WebPage> {
        lock(&self.webpages).get(key).cloned()
    }

    pub fn config_map(&self, key: &ObjectKey) -> Option<ConfigMap> {
        lock(&self.config_maps).get(key).cloned()
    }

    pub fn deployment(&self, key: &ObjectKey) -> Option<Deployment> {
        lock(&self.deployments).get(key).cloned()
    }

    /// Replace a ConfigMap directly, bypassing apply semantics (simulates
    /// an out-of-band edit).
    pub fn put_config_map(&self, key: &ObjectKey, mut config_map: ConfigMap) {
        config_map.metadata.resource_version = Some(self.next_version());
        lock(&self.config_maps).insert(key.clone(), config_map);
    }

    pub fn remove_config_map(&self, key: &ObjectKey) {
        lock(&self.config_maps).remove(key);
    }

    /// Make every subsequent `op` fail with `failure` until cleared.
    pub fn fail(&self, op: Operation, failure: InjectedFailure) {
        lock(&self.failures).insert(op, failure);
    }

    pub fn clear_failure(&self, op: Operation) {
        lock(&self.failures).remove(&op);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Delay only `op` by `latency`, overriding [`Self::set_latency`].
    pub fn set_latency_for(&self, op: Operation, latency: Duration) {
        lock(&self.op_latency).insert(op, latency);
    }

    /// All operations attempted so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        lock(&self.calls).clone()
    }

    /// Mutating operations attempted so far, in order.
    pub fn writes(&self) -> Vec<Operation> {
        self.calls().into_iter().filter(|op| op.is_write()).collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    async fn enter(&self, op: Operation) -> Result<(), StoreError> {
        lock(&self.calls).push(op);
        let latency = lock(&self.op_latency).get(&op).copied().or(*lock(&self.latency));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.failures).get(&op) {
            Some(failure) => Err(failure.to_error(op)),
            None => Ok(()),
        }
    }

    fn key_of<K: kube::Resource>(obj: &K) -> Result<ObjectKey, StoreError> {
        ObjectKey::of(obj).ok_or_else(|| {
            StoreError::InvalidRequest("object is missing name or namespace".to_string())
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockObjectStore {
    async fn get_webpage(&self, key: &ObjectKey) -> Result<Option<WebPage>, StoreError> {
        self.enter(Operation::GetWebPage).await?;
        Ok(self.webpage(key))
    }

    async fn update_webpage_status(
        &self,
        key: &ObjectKey,
        status: &WebPageStatus,
    ) -> Result<WebPage, StoreError> {
        self.enter(Operation::UpdateWebPageStatus).await?;
        let mut pages = lock(&self.webpages);
        let page = pages
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("webpages \"{}\" not found", key.name)))?;
        page.status = Some(status.clone());
        page.metadata.resource_version = Some(self.next_version());
        Ok(page.clone())
    }

    async fn set_webpage_finalizers(
        &self,
        page: &WebPage,
        finalizers: Vec<String>,
    ) -> Result<WebPage, StoreError> {
        self.enter(Operation::SetWebPageFinalizers).await?;
        let key = Self::key_of(page)?;
        let mut pages = lock(&self.webpages);
        let stored = pages
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("webpages \"{}\" not found", key.name)))?;
        let expected = page.metadata.resource_version.as_ref();
        if expected.is_some() && stored.metadata.resource_version.as_ref() != expected {
            return Err(StoreError::Conflict(format!(
                "the object has been modified; apply changes to the latest version: {key}"
            )));
        }
        stored.metadata.finalizers = if finalizers.is_empty() { None } else { Some(finalizers) };
        stored.metadata.resource_version = Some(self.next_version());
        let updated = stored.clone();
        if updated.metadata.deletion_timestamp.is_some() && updated.metadata.finalizers.is_none() {
            pages.remove(&key);
        }
        Ok(updated)
    }

    async fn get_config_map(&self, key: &ObjectKey) -> Result<Option<ConfigMap>, StoreError> {
        self.enter(Operation::GetConfigMap).await?;
        Ok(self.config_map(key))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.enter(Operation::CreateConfigMap).await?;
        let key = Self::key_of(config_map)?;
        let mut config_maps = lock(&self.config_maps);
        if config_maps.contains_key(&key) {
            return Err(StoreError::Conflict(format!("configmaps \"{}\" already exists", key.name)));
        }
        let mut created = config_map.clone();
        self.stamp(&mut created.metadata, None);
        config_maps.insert(key, created.clone());
        Ok(created)
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.enter(Operation::ApplyConfigMap).await?;
        let key = Self::key_of(config_map)?;
        let mut config_maps = lock(&self.config_maps);
        let existing = config_maps.get(&key);
        let mut applied = config_map.clone();
        self.stamp(&mut applied.metadata, existing.map(|e| &e.metadata));
        if let Some(existing) = existing {
            applied.metadata.labels = merge_labels(&existing.metadata, &applied.metadata);
        }
        config_maps.insert(key, applied.clone());
        Ok(applied)
    }

    async fn delete_config_map(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.enter(Operation::DeleteConfigMap).await?;
        lock(&self.config_maps)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("configmaps \"{}\" not found", key.name)))
    }

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>, StoreError> {
        self.enter(Operation::GetDeployment).await?;
        Ok(self.deployment(key))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.enter(Operation::CreateDeployment).await?;
        let key = Self::key_of(deployment)?;
        let mut deployments = lock(&self.deployments);
        if deployments.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "deployments.apps \"{}\" already exists",
                key.name
            )));
        }
        let mut created = deployment.clone();
        self.stamp(&mut created.metadata, None);
        deployments.insert(key, created.clone());
        Ok(created)
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.enter(Operation::ApplyDeployment).await?;
        let key = Self::key_of(deployment)?;
        let mut deployments = lock(&self.deployments);
        let existing = deployments.get(&key);
        let mut applied = deployment.clone();
        self.stamp(&mut applied.metadata, existing.map(|e| &e.metadata));
        if let Some(existing) = existing {
            applied.metadata.labels = merge_labels(&existing.metadata, &applied.metadata);
            applied.status = existing.status.clone();
        }
        deployments.insert(key, applied.clone());
        Ok(applied)
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.enter(Operation::DeleteDeployment).await?;
        lock(&self.deployments)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| {
                StoreError::NotFound(format!("deployments.apps \"{}\" not found", key.name))
            })
    }
}

/// Labels set by other field managers survive an apply.
fn merge_labels(
    existing: &ObjectMeta,
    applied: &ObjectMeta,
) -> Option<std::collections::BTreeMap<String, String>> {
    match (&existing.labels, &applied.labels) {
        (None, None) => None,
        (existing, applied) => {
            let mut merged = existing.clone().unwrap_or_default();
            merged.extend(applied.clone().unwrap_or_default());
            Some(merged)
        }
    }
}
