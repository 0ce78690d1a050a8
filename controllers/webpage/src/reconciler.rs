//! Reconciliation logic for WebPage CRDs.
//!
//! One pass fetches the WebPage, builds its desired ConfigMap and Deployment,
//! applies them in that order and then records `status.lastUpdateTime`.
//!
//! The reconciler never retries. Errors are returned to the caller, which owns
//! requeue and backoff. Every store call is bounded by the deadline passed to
//! [`Reconciler::reconcile`]; dropping the returned future cancels the pass.

use crate::config::{CascadeMode, DependentPolicy, ReconcilerSettings};
use crate::desired::{Dependents, content_name, desired_dependents, workload_name};
use crate::error::ControllerError;
use chrono::Utc;
use cluster_store::{ObjectKey, ObjectStore, StoreError};
use crds::{WebPage, WebPageStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::future::Future;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

/// Finalizer used when dependents are cleaned up by the controller itself.
pub const CLEANUP_FINALIZER: &str = "webpages.sandbox.rvmiller.com/cleanup";

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The WebPage no longer exists; nothing was written.
    ParentMissing,
    /// The WebPage is being deleted and the store garbage-collects dependents.
    Deleting,
    /// Dependents were deleted and the cleanup finalizer released.
    CleanedUp,
    /// Dependents match the spec. `status_written` is false when the status
    /// update failed, which does not fail the pass.
    Converged { status_written: bool },
}

/// Reconciles WebPage resources.
pub struct Reconciler {
    store: Box<dyn ObjectStore>,
    settings: ReconcilerSettings,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Run `fut` unless `deadline` passes first.
async fn within<F: Future>(
    deadline: Instant,
    what: String,
    fut: F,
) -> Result<F::Output, ControllerError> {
    timeout_at(deadline, fut)
        .await
        .map_err(|_| ControllerError::DeadlineExceeded(what))
}

fn apply_error<'a>(
    kind: &'static str,
    key: &'a ObjectKey,
) -> impl FnOnce(StoreError) -> ControllerError + 'a {
    move |source| ControllerError::Apply {
        kind,
        name: key.to_string(),
        source,
    }
}

fn owned_by(meta: &ObjectMeta, uid: Option<&str>) -> bool {
    let Some(uid) = uid else { return false };
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

fn has_cleanup_finalizer(page: &WebPage) -> bool {
    page.metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == CLEANUP_FINALIZER)
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(store: impl ObjectStore + 'static, settings: ReconcilerSettings) -> Self {
        Self {
            store: Box::new(store),
            settings,
        }
    }

    /// Reconciles one WebPage.
    ///
    /// This method:
    /// 1. Fetches the WebPage (absent means deleted: success, no writes)
    /// 2. Builds the desired ConfigMap and Deployment
    /// 3. Applies the ConfigMap, then the Deployment, stopping at the first failure
    /// 4. Sets `status.lastUpdateTime` (best effort)
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        deadline: Instant,
    ) -> Result<Outcome, ControllerError> {
        info!("Reconciling WebPage {}", key);

        let fetched = within(
            deadline,
            format!("fetching WebPage {key}"),
            self.store.get_webpage(key),
        )
        .await??;
        let Some(page) = fetched else {
            info!("WebPage {} not found, assuming deleted", key);
            return Ok(Outcome::ParentMissing);
        };

        if page.metadata.deletion_timestamp.is_some() {
            return match self.settings.cascade_mode {
                CascadeMode::Native => {
                    debug!("WebPage {} is being deleted, dependents are garbage collected", key);
                    Ok(Outcome::Deleting)
                }
                CascadeMode::Explicit => self.cleanup(key, &page, deadline).await,
            };
        }

        let dependents = desired_dependents(&page, &self.settings.image)?;

        let page = match self.settings.cascade_mode {
            CascadeMode::Native => page,
            CascadeMode::Explicit => self.ensure_finalizer(key, page, deadline).await?,
        };

        match self.settings.dependent_policy {
            DependentPolicy::ConvergeAlways => {
                self.apply_dependents(key, &dependents, deadline).await?;
            }
            DependentPolicy::CreateOnce => {
                self.create_missing_dependents(key, &dependents, deadline).await?;
            }
        }

        let status_written = self.record_update(key, &page, deadline).await;

        info!("Finished reconciling WebPage {}", key);
        Ok(Outcome::Converged { status_written })
    }

    /// Server-side apply both dependents, ConfigMap first.
    async fn apply_dependents(
        &self,
        key: &ObjectKey,
        dependents: &Dependents,
        deadline: Instant,
    ) -> Result<(), ControllerError> {
        let cm_key = key.sibling(content_name(&key.name));
        debug!("Applying ConfigMap {}", cm_key);
        within(
            deadline,
            format!("applying ConfigMap {cm_key}"),
            self.store.apply_config_map(&dependents.config_map),
        )
        .await?
        .map_err(apply_error("ConfigMap", &cm_key))?;

        let deploy_key = key.sibling(workload_name(&key.name));
        debug!("Applying Deployment {}", deploy_key);
        within(
            deadline,
            format!("applying Deployment {deploy_key}"),
            self.store.apply_deployment(&dependents.deployment),
        )
        .await?
        .map_err(apply_error("Deployment", &deploy_key))?;

        Ok(())
    }

    /// Create dependents that do not exist yet; existing ones are left alone.
    async fn create_missing_dependents(
        &self,
        key: &ObjectKey,
        dependents: &Dependents,
        deadline: Instant,
    ) -> Result<(), ControllerError> {
        let cm_key = key.sibling(content_name(&key.name));
        let existing = within(
            deadline,
            format!("fetching ConfigMap {cm_key}"),
            self.store.get_config_map(&cm_key),
        )
        .await?
        .map_err(apply_error("ConfigMap", &cm_key))?;
        if existing.is_none() {
            debug!("Creating ConfigMap {}", cm_key);
            let created = within(
                deadline,
                format!("creating ConfigMap {cm_key}"),
                self.store.create_config_map(&dependents.config_map),
            )
            .await?;
            match created {
                Ok(_) => {}
                // another pass created it between our get and create
                Err(e) if e.is_conflict() => debug!("ConfigMap {} already exists", cm_key),
                Err(e) => return Err(apply_error("ConfigMap", &cm_key)(e)),
            }
        }

        let deploy_key = key.sibling(workload_name(&key.name));
        let existing = within(
            deadline,
            format!("fetching Deployment {deploy_key}"),
            self.store.get_deployment(&deploy_key),
        )
        .await?
        .map_err(apply_error("Deployment", &deploy_key))?;
        if existing.is_none() {
            debug!("Creating Deployment {}", deploy_key);
            let created = within(
                deadline,
                format!("creating Deployment {deploy_key}"),
                self.store.create_deployment(&dependents.deployment),
            )
            .await?;
            match created {
                Ok(_) => {}
                Err(e) if e.is_conflict() => debug!("Deployment {} already exists", deploy_key),
                Err(e) => return Err(apply_error("Deployment", &deploy_key)(e)),
            }
        }

        Ok(())
    }

    /// Write `status.lastUpdateTime`. Failures are logged and reported as `false`.
    async fn record_update(&self, key: &ObjectKey, page: &WebPage, deadline: Instant) -> bool {
        let now = Utc::now();
        // never move backwards, even if this node's clock is behind the last writer's
        let stamp = page.last_update_time().map_or(now, |previous| previous.max(now));
        let status = WebPageStatus {
            last_update_time: Some(stamp),
        };

        match timeout_at(deadline, self.store.update_webpage_status(key, &status)).await {
            Ok(Ok(_)) => {
                debug!("Updated WebPage {} status", key);
                true
            }
            Ok(Err(e)) => {
                error!("Unable to update WebPage {} status: {}", key, e);
                false
            }
            Err(_) => {
                error!("Unable to update WebPage {} status: deadline exceeded", key);
                false
            }
        }
    }

    /// Add the cleanup finalizer if missing, returning the stored WebPage.
    async fn ensure_finalizer(
        &self,
        key: &ObjectKey,
        page: WebPage,
        deadline: Instant,
    ) -> Result<WebPage, ControllerError> {
        if has_cleanup_finalizer(&page) {
            return Ok(page);
        }
        let mut finalizers = page.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(CLEANUP_FINALIZER.to_string());
        debug!("Adding finalizer to WebPage {}", key);
        let updated = within(
            deadline,
            format!("adding finalizer to WebPage {key}"),
            self.store.set_webpage_finalizers(&page, finalizers),
        )
        .await??;
        Ok(updated)
    }

    /// Delete dependents owned by `page`, then release the cleanup finalizer.
    async fn cleanup(
        &self,
        key: &ObjectKey,
        page: &WebPage,
        deadline: Instant,
    ) -> Result<Outcome, ControllerError> {
        if !has_cleanup_finalizer(page) {
            debug!("WebPage {} is being deleted without our finalizer", key);
            return Ok(Outcome::Deleting);
        }
        info!("Cleaning up dependents of WebPage {}", key);
        let uid = page.metadata.uid.as_deref();

        // Deployment first so no pod is left mounting a missing ConfigMap
        let deploy_key = key.sibling(workload_name(&key.name));
        let deployment = within(
            deadline,
            format!("fetching Deployment {deploy_key}"),
            self.store.get_deployment(&deploy_key),
        )
        .await??;
        if deployment.is_some_and(|d| owned_by(&d.metadata, uid)) {
            let deleted = within(
                deadline,
                format!("deleting Deployment {deploy_key}"),
                self.store.delete_deployment(&deploy_key),
            )
            .await?;
            tolerate_not_found(deleted)?;
        }

        let cm_key = key.sibling(content_name(&key.name));
        let config_map = within(
            deadline,
            format!("fetching ConfigMap {cm_key}"),
            self.store.get_config_map(&cm_key),
        )
        .await??;
        if config_map.is_some_and(|c| owned_by(&c.metadata, uid)) {
            let deleted = within(
                deadline,
                format!("deleting ConfigMap {cm_key}"),
                self.store.delete_config_map(&cm_key),
            )
            .await?;
            tolerate_not_found(deleted)?;
        }

        let remaining: Vec<String> = page
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| *f != CLEANUP_FINALIZER)
            .cloned()
            .collect();
        let released = within(
            deadline,
            format!("removing finalizer from WebPage {key}"),
            self.store.set_webpage_finalizers(page, remaining),
        )
        .await?;
        match released {
            Ok(_) => {}
            Err(e) if e.is_not_found() => warn!("WebPage {} disappeared during cleanup", key),
            Err(e) => return Err(e.into()),
        }

        info!("Cleaned up dependents of WebPage {}", key);
        Ok(Outcome::CleanedUp)
    }
}

fn tolerate_not_found(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
