//! Kubernetes resource watchers.
//!
//! Binds reconciliation to change notifications using
//! `kube_runtime::Controller`. WebPages are watched directly; ConfigMaps and
//! Deployments are watched through their controller owner reference, so a
//! change to either dependent requeues the owning WebPage.
//!
//! The WebPage trigger is filtered on `metadata.generation`. Status writes,
//! including the `lastUpdateTime` patch every pass makes, and finalizer edits
//! leave the generation alone and never start a pass. Spec edits and deletion
//! bump it. Drift in a dependent still arrives through the owned watches.
//!
//! The runtime coalesces triggers per WebPage and never runs two passes for
//! the same WebPage at once. Retry backoff lives here, not in the reconciler.

use crate::backoff::RetryTracker;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::{Outcome, Reconciler};
use crate::telemetry::Metrics;
use cluster_store::ObjectKey;
use crds::WebPage;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Requeue delay for objects that cannot be keyed.
const UNKEYED_REQUEUE: Duration = Duration::from_secs(300);

/// State shared by every reconciliation pass.
#[derive(Debug)]
pub struct Context {
    pub reconciler: Reconciler,
    pub retries: RetryTracker,
    pub metrics: Arc<Metrics>,
    /// Upper bound on one pass
    pub reconcile_timeout: Duration,
}

/// Watches WebPages and the objects they own.
#[derive(Debug)]
pub struct Watcher {
    pages: Api<WebPage>,
    config_maps: Api<ConfigMap>,
    deployments: Api<Deployment>,
    runtime_config: RuntimeConfig,
    context: Arc<Context>,
    /// Set once the WebPage cache has completed its initial list
    ready: Arc<AtomicBool>,
}

impl Watcher {
    /// Creates a new watcher scoped to `config.namespace`, or all namespaces.
    pub fn new(
        client: Client,
        config: &ControllerConfig,
        context: Arc<Context>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        let (pages, config_maps, deployments) = match config.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client, ns),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client),
            ),
        };

        let runtime_config = RuntimeConfig::default()
            .debounce(config.debounce)
            .concurrency(config.concurrency);

        Self {
            pages,
            config_maps,
            deployments,
            runtime_config,
            context,
            ready,
        }
    }

    /// Runs the controller loop until a termination signal arrives.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Starting WebPage watcher");

        let (reader, writer) = reflector::store();
        let context = Arc::clone(&self.context);
        let events = watcher(self.pages, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .inspect(move |event| forget_deleted(&context.retries, event));
        let pages = spec_changes(events.applied_objects());

        let cache = reader.clone();
        let ready = self.ready;
        let readiness = async move {
            match cache.wait_until_ready().await {
                Ok(()) => {
                    info!("WebPage cache synced");
                    ready.store(true, Ordering::Release);
                }
                Err(e) => warn!("WebPage cache never synced: {}", e),
            }
        };

        let controller = Controller::for_stream(pages, reader)
            .owns(self.config_maps, watcher::Config::default())
            .owns(self.deployments, watcher::Config::default())
            .with_config(self.runtime_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {}", obj),
                    Err(e) => warn!("WebPage controller error: {}", e),
                }
            });

        futures::future::join(readiness, controller).await;

        info!("WebPage watcher stopped");
        Ok(())
    }
}

/// WebPages whose `metadata.generation` changed since they were last seen.
fn spec_changes<S>(
    pages: S,
) -> impl Stream<Item = Result<WebPage, watcher::Error>> + Send + 'static
where
    S: Stream<Item = Result<WebPage, watcher::Error>> + Send + 'static,
{
    pages.predicate_filter(predicates::generation)
}

/// Drop backoff state of WebPages the watch reports as deleted.
fn forget_deleted(retries: &RetryTracker, event: &watcher::Result<watcher::Event<WebPage>>) {
    let deleted = match event {
        Ok(watcher::Event::Delete(page)) => ObjectKey::of(page),
        _ => None,
    };
    if let Some(key) = deleted {
        retries.forget(&key);
    }
}

/// One pass for the WebPage the runtime handed us.
///
/// Only the identity of `page` is used; the reconciler re-reads the current
/// object so a stale cache entry never drives writes.
async fn reconcile(page: Arc<WebPage>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let Some(key) = ObjectKey::of(page.as_ref()) else {
        warn!("Ignoring WebPage without namespace or name");
        return Ok(Action::await_change());
    };

    let started = Instant::now();
    let result = ctx.reconciler.reconcile(&key, started + ctx.reconcile_timeout).await;
    ctx.metrics.record(&result, started.elapsed());

    match result? {
        Outcome::Converged { status_written: false } => {
            debug!("WebPage {} converged without a status update", key);
        }
        outcome => debug!("WebPage {} finished with {:?}", key, outcome),
    }
    ctx.retries.forget(&key);
    Ok(Action::await_change())
}

/// Requeue failed passes with per-object Fibonacci backoff.
fn error_policy(page: Arc<WebPage>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let Some(key) = ObjectKey::of(page.as_ref()) else {
        return Action::requeue(UNKEYED_REQUEUE);
    };
    let delay = ctx.retries.record_failure(&key);
    let delay_secs = delay.as_secs();
    if error.is_retryable() {
        warn!("Reconciling WebPage {} failed, retrying in {}s: {}", key, delay_secs, error);
    } else {
        error!("Reconciling WebPage {} failed, retrying in {}s: {}", key, delay_secs, error);
    }
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilerSettings;
    use crate::test_utils::{create_test_reconciler, create_test_webpage, seed_webpage};
    use chrono::Utc;
    use cluster_store::InjectedFailure;
    use cluster_store::Operation;
    use crds::WebPageStatus;

    fn context(reconciler: Reconciler) -> Arc<Context> {
        Arc::new(Context {
            reconciler,
            retries: RetryTracker::default(),
            metrics: Arc::new(Metrics::new().unwrap()),
            reconcile_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_reconcile_awaits_change_after_success() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        seed_webpage(&store, "foo", "<h1>A</h1>");
        let ctx = context(reconciler);
        let page = Arc::new(create_test_webpage("foo", "default", "<h1>A</h1>"));

        let action = reconcile(page, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(store.deployment(&ObjectKey::new("default", "foo")).is_some());
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_per_object() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        seed_webpage(&store, "foo", "<h1>A</h1>");
        store.fail(Operation::ApplyConfigMap, InjectedFailure::Transient);
        let ctx = context(reconciler);
        let page = Arc::new(create_test_webpage("foo", "default", "<h1>A</h1>"));

        let err = reconcile(page.clone(), ctx.clone()).await.unwrap_err();
        let minutes = |m: u64| Action::requeue(Duration::from_secs(60 * m));
        assert_eq!(error_policy(page.clone(), &err, ctx.clone()), minutes(1));
        assert_eq!(error_policy(page.clone(), &err, ctx.clone()), minutes(1));
        assert_eq!(error_policy(page.clone(), &err, ctx.clone()), minutes(2));

        // a successful pass starts the sequence over
        store.clear_failure(Operation::ApplyConfigMap);
        reconcile(page.clone(), ctx.clone()).await.unwrap();
        assert_eq!(error_policy(page, &err, ctx), minutes(1));
    }

    #[tokio::test]
    async fn test_status_only_changes_do_not_trigger() {
        let mut created = create_test_webpage("foo", "default", "<h1>A</h1>");
        created.metadata.generation = Some(1);
        created.metadata.resource_version = Some("1".to_string());

        // what the status patch of a pass produces
        let mut status_written = created.clone();
        status_written.status = Some(WebPageStatus {
            last_update_time: Some(Utc::now()),
        });
        status_written.metadata.resource_version = Some("2".to_string());

        let mut finalized = status_written.clone();
        finalized.metadata.finalizers = Some(vec!["example.com/other".to_string()]);
        finalized.metadata.resource_version = Some("3".to_string());

        let mut edited = finalized.clone();
        edited.spec.html = "<h1>B</h1>".to_string();
        edited.metadata.generation = Some(2);
        edited.metadata.resource_version = Some("4".to_string());

        let events =
            futures::stream::iter(vec![Ok(created), Ok(status_written), Ok(finalized), Ok(edited)]);
        let triggers: Vec<WebPage> = spec_changes(events).map(|page| page.unwrap()).collect().await;

        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].spec.html, "<h1>A</h1>");
        assert_eq!(triggers[1].spec.html, "<h1>B</h1>");
    }

    #[tokio::test]
    async fn test_pages_are_filtered_independently() {
        let mut foo = create_test_webpage("foo", "default", "<h1>A</h1>");
        foo.metadata.generation = Some(1);
        let mut bar = create_test_webpage("bar", "default", "<h1>A</h1>");
        bar.metadata.generation = Some(1);

        let events = futures::stream::iter(vec![Ok(foo.clone()), Ok(bar), Ok(foo)]);
        let triggers: Vec<WebPage> = spec_changes(events).map(|page| page.unwrap()).collect().await;

        let names: Vec<_> = triggers.iter().filter_map(|p| p.metadata.name.as_deref()).collect();
        assert_eq!(names, vec!["foo", "bar"]);
    }

    #[test]
    fn test_deleted_page_forgets_backoff() {
        let retries = RetryTracker::default();
        let key = ObjectKey::new("default", "foo");
        retries.record_failure(&key);
        retries.record_failure(&key);
        retries.record_failure(&key);

        // other events leave the state alone
        let page = create_test_webpage("foo", "default", "<h1>A</h1>");
        forget_deleted(&retries, &Ok(watcher::Event::Apply(page.clone())));
        assert_eq!(retries.record_failure(&key), Duration::from_secs(180));

        forget_deleted(&retries, &Ok(watcher::Event::Delete(page)));
        assert_eq!(retries.record_failure(&key), Duration::from_secs(60));
    }
}
