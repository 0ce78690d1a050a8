//! Unit tests for the WebPage reconciler

#[cfg(test)]
mod tests {
    use crate::config::{CascadeMode, DependentPolicy, ReconcilerSettings};
    use crate::desired::CONTENT_KEY;
    use crate::error::ControllerError;
    use crate::reconciler::{CLEANUP_FINALIZER, Outcome};
    use crate::test_utils::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use cluster_store::{InjectedFailure, ObjectKey, Operation};
    use crds::WebPageStatus;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::Instant;

    fn cm_key(name: &str) -> ObjectKey {
        ObjectKey::new("default", format!("{name}-config"))
    }

    fn html_of(cm: &ConfigMap) -> String {
        cm.data.as_ref().unwrap()[CONTENT_KEY].clone()
    }

    fn explicit_cleanup() -> ReconcilerSettings {
        ReconcilerSettings {
            cascade_mode: CascadeMode::Explicit,
            ..ReconcilerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_first_pass_creates_dependents() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::Converged { status_written: true });
        let cm = store.config_map(&cm_key("foo")).unwrap();
        assert_eq!(html_of(&cm), "<h1>A</h1>");
        assert!(store.deployment(&key).is_some());
    }

    #[tokio::test]
    async fn test_config_map_applied_before_deployment() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");

        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(
            store.writes(),
            vec![
                Operation::ApplyConfigMap,
                Operation::ApplyDeployment,
                Operation::UpdateWebPageStatus,
            ]
        );
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");

        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        let cm_first = store.config_map(&cm_key("foo")).unwrap();
        let deploy_first = store.deployment(&key).unwrap();

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();
        let cm_second = store.config_map(&cm_key("foo")).unwrap();
        let deploy_second = store.deployment(&key).unwrap();

        assert_eq!(outcome, Outcome::Converged { status_written: true });
        assert_eq!(cm_first.data, cm_second.data);
        assert_eq!(cm_first.metadata.uid, cm_second.metadata.uid);
        assert_eq!(cm_first.metadata.owner_references, cm_second.metadata.owner_references);
        assert_eq!(deploy_first.spec, deploy_second.spec);
        assert_eq!(deploy_first.metadata.uid, deploy_second.metadata.uid);
    }

    #[tokio::test]
    async fn test_drift_is_healed() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        let mut tampered = store.config_map(&cm_key("foo")).unwrap();
        tampered.data = Some(BTreeMap::from([(CONTENT_KEY.to_string(), "tampered".to_string())]));
        store.put_config_map(&cm_key("foo"), tampered);

        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(html_of(&store.config_map(&cm_key("foo")).unwrap()), "<h1>A</h1>");
    }

    #[tokio::test]
    async fn test_deleted_dependent_is_recreated() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        store.remove_config_map(&cm_key("foo"));
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert!(store.config_map(&cm_key("foo")).is_some());
    }

    #[tokio::test]
    async fn test_spec_change_propagates() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        store.update_webpage_spec(&key, "<h1>B</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(html_of(&store.config_map(&cm_key("foo")).unwrap()), "<h1>B</h1>");
    }

    #[tokio::test]
    async fn test_create_once_leaves_drift_alone() {
        let settings = ReconcilerSettings {
            dependent_policy: DependentPolicy::CreateOnce,
            ..ReconcilerSettings::default()
        };
        let (reconciler, store) = create_test_reconciler(settings);
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");

        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        assert_eq!(html_of(&store.config_map(&cm_key("foo")).unwrap()), "<h1>A</h1>");
        assert!(store.deployment(&key).is_some());

        let mut tampered = store.config_map(&cm_key("foo")).unwrap();
        tampered.data = Some(BTreeMap::from([(CONTENT_KEY.to_string(), "tampered".to_string())]));
        store.put_config_map(&cm_key("foo"), tampered);
        store.clear_calls();

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::Converged { status_written: true });
        assert_eq!(html_of(&store.config_map(&cm_key("foo")).unwrap()), "tampered");
        assert_eq!(store.writes(), vec![Operation::UpdateWebPageStatus]);
    }

    #[tokio::test]
    async fn test_create_once_tolerates_racing_create() {
        let settings = ReconcilerSettings {
            dependent_policy: DependentPolicy::CreateOnce,
            ..ReconcilerSettings::default()
        };
        let (reconciler, store) = create_test_reconciler(settings);
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.fail(Operation::CreateConfigMap, InjectedFailure::Conflict);

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::Converged { status_written: true });
        assert!(store.deployment(&key).is_some());
    }

    #[tokio::test]
    async fn test_missing_parent_is_noop() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = ObjectKey::new("default", "gone");

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::ParentMissing);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_is_returned() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.fail(Operation::GetWebPage, InjectedFailure::Transient);

        let err = reconciler.reconcile(&key, far_deadline()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Store(_)));
        assert!(err.is_retryable());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_dependents_point_at_parent() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        let uid = store.webpage(&key).unwrap().metadata.uid.unwrap();

        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        let cm = store.config_map(&cm_key("foo")).unwrap();
        let cm_owners = cm.metadata.owner_references.unwrap();
        let deploy_owners = store.deployment(&key).unwrap().metadata.owner_references.unwrap();
        for owners in [cm_owners, deploy_owners] {
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].uid, uid);
            assert_eq!(owners[0].controller, Some(true));
        }
    }

    #[tokio::test]
    async fn test_status_set_after_success() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        let before = Utc::now();

        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        let first = store.webpage(&key).unwrap().last_update_time().unwrap();
        assert!(first >= before);

        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        let second = store.webpage(&key).unwrap().last_update_time().unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_status_never_moves_backwards() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let mut page = create_test_webpage("foo", "default", "<h1>A</h1>");
        let future = Utc::now() + ChronoDuration::hours(1);
        page.status = Some(WebPageStatus {
            last_update_time: Some(future),
        });
        store.insert_webpage(page);
        let key = ObjectKey::new("default", "foo");

        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(store.webpage(&key).unwrap().last_update_time(), Some(future));
    }

    #[tokio::test]
    async fn test_config_map_failure_stops_pass() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.fail(Operation::ApplyConfigMap, InjectedFailure::Transient);

        let err = reconciler.reconcile(&key, far_deadline()).await.unwrap_err();

        match err {
            ControllerError::Apply { kind, ref name, .. } => {
                assert_eq!(kind, "ConfigMap");
                assert_eq!(name, "default/foo-config");
            }
            other => panic!("expected apply error, got {other:?}"),
        }
        assert_eq!(store.writes(), vec![Operation::ApplyConfigMap]);
        assert_eq!(store.webpage(&key).unwrap().last_update_time(), None);
    }

    #[tokio::test]
    async fn test_deployment_failure_keeps_config_map() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.fail(Operation::ApplyDeployment, InjectedFailure::Fatal);

        let err = reconciler.reconcile(&key, far_deadline()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Apply { kind: "Deployment", .. }));
        assert!(!err.is_retryable());
        assert!(store.config_map(&cm_key("foo")).is_some());
        assert!(store.deployment(&key).is_none());
        assert_eq!(store.webpage(&key).unwrap().last_update_time(), None);

        // converges once the store recovers
        store.clear_failure(Operation::ApplyDeployment);
        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        assert!(store.deployment(&key).is_some());
        assert!(store.webpage(&key).unwrap().last_update_time().is_some());
    }

    #[tokio::test]
    async fn test_status_failure_does_not_fail_pass() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.fail(Operation::UpdateWebPageStatus, InjectedFailure::Conflict);

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::Converged { status_written: false });
        assert!(store.deployment(&key).is_some());
        assert_eq!(store.webpage(&key).unwrap().last_update_time(), None);
    }

    #[tokio::test]
    async fn test_deadline_aborts_pass() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.set_latency(Duration::from_millis(200));

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = reconciler.reconcile(&key, deadline).await.unwrap_err();

        assert!(matches!(err, ControllerError::DeadlineExceeded(_)));
        assert!(err.is_retryable());
        assert!(store.writes().is_empty());
        assert_eq!(store.webpage(&key).unwrap().last_update_time(), None);
    }

    #[tokio::test]
    async fn test_deadline_during_status_write_keeps_pass() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        store.set_latency_for(Operation::UpdateWebPageStatus, Duration::from_millis(500));

        let deadline = Instant::now() + Duration::from_millis(100);
        let outcome = reconciler.reconcile(&key, deadline).await.unwrap();

        assert_eq!(outcome, Outcome::Converged { status_written: false });
        assert!(store.config_map(&cm_key("foo")).is_some());
        assert!(store.deployment(&key).is_some());
        assert_eq!(store.webpage(&key).unwrap().last_update_time(), None);
    }

    #[tokio::test]
    async fn test_native_cascade_leaves_deletion_to_store() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let mut page = create_test_webpage("foo", "default", "<h1>A</h1>");
        page.metadata.finalizers = Some(vec!["example.com/other".to_string()]);
        store.insert_webpage(page);
        let key = ObjectKey::new("default", "foo");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        store.delete_webpage(&key);
        store.clear_calls();

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::Deleting);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_cascade_adds_finalizer() {
        let (reconciler, store) = create_test_reconciler(explicit_cleanup());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");

        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        let page = store.webpage(&key).unwrap();
        assert_eq!(page.metadata.finalizers, Some(vec![CLEANUP_FINALIZER.to_string()]));
        assert!(page.last_update_time().is_some());
        assert_eq!(store.writes()[0], Operation::SetWebPageFinalizers);
    }

    #[tokio::test]
    async fn test_explicit_cascade_cleans_up_on_delete() {
        let (reconciler, store) = create_test_reconciler(explicit_cleanup());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        store.delete_webpage(&key);
        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::CleanedUp);
        assert!(store.deployment(&key).is_none());
        assert!(store.config_map(&cm_key("foo")).is_none());
        assert!(store.webpage(&key).is_none());
    }

    #[tokio::test]
    async fn test_explicit_cleanup_tolerates_missing_dependents() {
        let (reconciler, store) = create_test_reconciler(explicit_cleanup());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        // ConfigMap already gone, Deployment vanishes between fetch and delete
        store.remove_config_map(&cm_key("foo"));
        store.fail(Operation::DeleteDeployment, InjectedFailure::NotFound);
        store.delete_webpage(&key);
        store.clear_calls();

        let outcome = reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert_eq!(outcome, Outcome::CleanedUp);
        assert!(store.writes().contains(&Operation::DeleteDeployment));
        assert!(!store.writes().contains(&Operation::DeleteConfigMap));
        assert!(store.webpage(&key).is_none());
    }

    #[tokio::test]
    async fn test_explicit_cleanup_spares_foreign_objects() {
        let (reconciler, store) = create_test_reconciler(explicit_cleanup());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        let mut foreign = store.config_map(&cm_key("foo")).unwrap();
        foreign.metadata.owner_references = None;
        store.put_config_map(&cm_key("foo"), foreign);

        store.delete_webpage(&key);
        reconciler.reconcile(&key, far_deadline()).await.unwrap();

        assert!(store.config_map(&cm_key("foo")).is_some());
        assert!(store.deployment(&key).is_none());
    }

    #[tokio::test]
    async fn test_explicit_cleanup_failure_keeps_finalizer() {
        let (reconciler, store) = create_test_reconciler(explicit_cleanup());
        let key = seed_webpage(&store, "foo", "<h1>A</h1>");
        reconciler.reconcile(&key, far_deadline()).await.unwrap();
        store.delete_webpage(&key);
        store.fail(Operation::DeleteDeployment, InjectedFailure::Transient);

        assert!(reconciler.reconcile(&key, far_deadline()).await.is_err());

        let page = store.webpage(&key).unwrap();
        assert_eq!(page.metadata.finalizers, Some(vec![CLEANUP_FINALIZER.to_string()]));
    }

    #[tokio::test]
    async fn test_missing_uid_fails_build_without_writes() {
        let (reconciler, store) = create_test_reconciler(ReconcilerSettings::default());
        let key = ObjectKey::new("default", "foo");
        let mut page = create_test_webpage("foo", "default", "<h1>A</h1>");
        page.metadata.uid = None;
        store.put_webpage(&key, page);

        let err = reconciler.reconcile(&key, far_deadline()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Build(_)));
        assert!(store.writes().is_empty());
    }
}
