//! Desired state of the objects a WebPage owns.
//!
//! Pure functions: given a WebPage they return the complete ConfigMap and
//! Deployment the controller should submit, owner reference included. Names
//! are derived from the WebPage name only, so they are stable across
//! namespaces and across passes.

use crate::error::ControllerError;
use crds::WebPage;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;

/// Field manager and `app.kubernetes.io/managed-by` value.
pub const FIELD_MANAGER: &str = "webpage-controller";
/// Label selecting everything that belongs to one WebPage.
pub const PAGE_LABEL: &str = "webpage";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Key of the page contents in the ConfigMap.
pub const CONTENT_KEY: &str = "index.html";

const CONTENT_SUFFIX: &str = "-config";
const CONTAINER_NAME: &str = "nginx";
const VOLUME_NAME: &str = "config-volume";
const MOUNT_PATH: &str = "/usr/share/nginx/html";

/// Name of the ConfigMap holding the page contents.
pub fn content_name(page_name: &str) -> String {
    format!("{page_name}{CONTENT_SUFFIX}")
}

/// Name of the Deployment serving the page.
pub fn workload_name(page_name: &str) -> String {
    page_name.to_string()
}

/// Desired dependents of one WebPage, in apply order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependents {
    pub config_map: ConfigMap,
    pub deployment: Deployment,
}

/// Build both dependents. The Deployment mounts the ConfigMap built here.
pub fn desired_dependents(page: &WebPage, image: &str) -> Result<Dependents, ControllerError> {
    let config_map = desired_config_map(page)?;
    let deployment = desired_deployment(page, &config_map, image)?;
    Ok(Dependents { config_map, deployment })
}

/// ConfigMap with a single `index.html` entry copied verbatim from `spec.html`.
pub fn desired_config_map(page: &WebPage) -> Result<ConfigMap, ControllerError> {
    let owner = owner_reference(page)?;
    let (namespace, name) = page_identity(page)?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(content_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(object_labels(name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONTENT_KEY.to_string(), page.spec.html.clone())])),
        ..Default::default()
    })
}

/// Single-replica nginx Deployment serving `config_map` as its web root.
pub fn desired_deployment(
    page: &WebPage,
    config_map: &ConfigMap,
    image: &str,
) -> Result<Deployment, ControllerError> {
    let owner = owner_reference(page)?;
    let (namespace, name) = page_identity(page)?;
    let content = config_map.metadata.name.clone().ok_or_else(|| {
        ControllerError::Build(format!("ConfigMap for WebPage {namespace}/{name} has no name"))
    })?;
    let selector = selector_labels(name);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(object_labels(name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(image.to_string()),
                        volume_mounts: Some(vec![VolumeMount {
                            name: VOLUME_NAME.to_string(),
                            mount_path: MOUNT_PATH.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: VOLUME_NAME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: content,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Controller owner reference pointing at `page`.
///
/// Fails when the page has no name or UID, e.g. an object that was never
/// persisted by the API server.
pub fn owner_reference(page: &WebPage) -> Result<OwnerReference, ControllerError> {
    page.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::Build(format!(
            "WebPage {} has no name or uid, cannot set owner reference",
            page.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })
}

fn page_identity(page: &WebPage) -> Result<(&str, &str), ControllerError> {
    let name = page
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::Build("WebPage has no name".to_string()))?;
    let namespace = page
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| ControllerError::Build(format!("WebPage {name} has no namespace")))?;
    Ok((namespace, name))
}

fn selector_labels(page_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(PAGE_LABEL.to_string(), page_name.to_string())])
}

fn object_labels(page_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(page_name);
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    labels
}
