//! Kubernetes-backed object store
//!
//! Writes go through server-side apply with a fixed field manager, so the
//! API server tracks which fields this controller owns and repeated applies
//! of the same object are no-ops.

use crate::error::StoreError;
use crate::models::ObjectKey;
use crate::store_trait::ObjectStore;
use crds::{WebPage, WebPageStatus};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use tracing::debug;

/// Object store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    /// Create a new store. `field_manager` names this controller in
    /// server-side apply field ownership.
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn key_of<K>(obj: &K) -> Result<ObjectKey, StoreError>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        ObjectKey::of(obj).ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "{} is missing metadata.name or metadata.namespace",
                K::kind(&K::DynamicType::default())
            ))
        })
    }

    async fn get<K>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.api(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let key = Self::key_of(obj)?;
        debug!("Creating {} {}", K::kind(&K::DynamicType::default()), key);
        let pp = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..PostParams::default()
        };
        Ok(self.api(&key.namespace).create(&pp, obj).await?)
    }

    async fn apply<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let key = Self::key_of(obj)?;
        debug!("Applying {} {}", K::kind(&K::DynamicType::default()), key);
        // force: take over fields another manager touched (e.g. a manual kubectl edit)
        let pp = PatchParams::apply(&self.field_manager).force();
        Ok(self.api(&key.namespace).patch(&key.name, &pp, &Patch::Apply(obj)).await?)
    }

    async fn delete<K>(&self, key: &ObjectKey) -> Result<(), StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        debug!("Deleting {} {}", K::kind(&K::DynamicType::default()), key);
        let api: Api<K> = self.api(&key.namespace);
        api.delete(&key.name, &DeleteParams::background()).await?;
        Ok(())
    }
}

impl Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_webpage(&self, key: &ObjectKey) -> Result<Option<WebPage>, StoreError> {
        self.get(key).await
    }

    async fn update_webpage_status(
        &self,
        key: &ObjectKey,
        status: &WebPageStatus,
    ) -> Result<WebPage, StoreError> {
        let status_patch = json!({
            "status": status
        });
        let api: Api<WebPage> = self.api(&key.namespace);
        let pp = PatchParams::default();
        Ok(api.patch_status(&key.name, &pp, &Patch::Merge(&status_patch)).await?)
    }

    async fn set_webpage_finalizers(
        &self,
        page: &WebPage,
        finalizers: Vec<String>,
    ) -> Result<WebPage, StoreError> {
        let key = Self::key_of(page)?;
        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": page.metadata.resource_version,
            }
        });
        let api: Api<WebPage> = self.api(&key.namespace);
        Ok(api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await?)
    }

    async fn get_config_map(&self, key: &ObjectKey) -> Result<Option<ConfigMap>, StoreError> {
        self.get(key).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.create(config_map).await
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.apply(config_map).await
    }

    async fn delete_config_map(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.delete::<ConfigMap>(key).await
    }

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>, StoreError> {
        self.get(key).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.create(deployment).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.apply(deployment).await
    }

    async fn delete_deployment(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.delete::<Deployment>(key).await
    }
}
