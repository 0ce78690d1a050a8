//! WebPage CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the WebPage controller.

pub mod webpage;

pub use webpage::*;
