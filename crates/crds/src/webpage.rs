//! WebPage CRD
//!
//! Declares a static web page. The controller serves `spec.html` through a
//! ConfigMap mounted into an nginx Deployment.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "sandbox.rvmiller.com",
    version = "v1beta1",
    kind = "WebPage",
    plural = "webpages",
    namespaced,
    status = "WebPageStatus",
    printcolumn = r#"{"name":"Updated", "type":"date", "jsonPath":".status.lastUpdateTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WebPageSpec {
    /// Static web page contents
    #[schemars(length(min = 1))]
    pub html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebPageStatus {
    /// Last time the dependents were successfully applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl WebPage {
    /// Last recorded update time, if the page was ever reconciled.
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.last_update_time)
    }
}
