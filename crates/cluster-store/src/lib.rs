//! Declarative Object Store
//!
//! Access to the objects the WebPage controller reads and writes: the
//! `WebPage` parent plus its `ConfigMap` and `Deployment` dependents.
//!
//! The [`ObjectStore`] trait is the only capability the reconciler depends
//! on. [`KubeStore`] implements it against the Kubernetes API server using
//! server-side apply; [`MockObjectStore`] (feature `test-util`) keeps
//! objects in memory for unit tests.
//!
//! # Example
//!
//! ```no_run
//! use cluster_store::{KubeStore, ObjectKey, ObjectStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeStore::new(client, "webpage-controller");
//!
//! let key = ObjectKey::new("default", "home");
//! if let Some(page) = store.get_webpage(&key).await? {
//!     println!("{}", page.spec.html);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeStore;
pub use error::StoreError;
pub use models::ObjectKey;
pub use store_trait::ObjectStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{InjectedFailure, MockObjectStore, Operation};
