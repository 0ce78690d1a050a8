//! Test utilities for unit testing the reconciler
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::config::ReconcilerSettings;
use crate::reconciler::Reconciler;
use cluster_store::{MockObjectStore, ObjectKey};
use crds::{WebPage, WebPageSpec};
use std::time::Duration;
use tokio::time::Instant;

/// Helper to create a test WebPage as the API server would return it
pub fn create_test_webpage(name: &str, namespace: &str, html: &str) -> WebPage {
    let mut page = WebPage::new(name, WebPageSpec { html: html.to_string() });
    page.metadata.namespace = Some(namespace.to_string());
    page.metadata.uid = Some(format!("uid-{namespace}-{name}"));
    page
}

/// Helper to create a reconciler over a mock store, returning a handle to the store
pub fn create_test_reconciler(settings: ReconcilerSettings) -> (Reconciler, MockObjectStore) {
    let store = MockObjectStore::new();
    (Reconciler::new(store.clone(), settings), store)
}

/// Store `html` as WebPage `default/<name>` and return its key
pub fn seed_webpage(store: &MockObjectStore, name: &str, html: &str) -> ObjectKey {
    store.insert_webpage(create_test_webpage(name, "default", html));
    ObjectKey::new("default", name)
}

/// A deadline far enough away that tests never hit it
pub fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}
