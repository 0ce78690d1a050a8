//! Object store errors

use thiserror::Error;

/// Errors that can occur when talking to the object store.
///
/// Variants are the classification the reconciler acts on; the original
/// transport error is kept only as its message.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists or was modified concurrently
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store temporarily unavailable (throttling, server error, transport)
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Request rejected and will not succeed on retry as-is
    #[error("Store error: {0}")]
    Fatal(String),

    /// Object is missing identity metadata needed for the request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) => {
                let message = response.message.clone();
                match response.code {
                    404 => Self::NotFound(message),
                    409 => Self::Conflict(message),
                    429 | 500..=599 => Self::Transient(message),
                    _ => Self::Fatal(format!("{} ({})", message, response.code)),
                }
            }
            kube::Error::SerdeError(_) => Self::Fatal(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}
