use std::error::Error as StdError;
use std::sync::Arc;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Broad failure category, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Unsupported,
    Backend,
    Cancelled,
}

/// Every failure an adapter operation can report.
///
/// Cloneable so a failed lazy initialization can be replayed to every
/// caller that shares the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("revision {revision} not found in history of {id} ({available} revisions)")]
    RevisionNotFound {
        id: String,
        revision: i64,
        available: usize,
    },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{operation} is not supported by {backend}: {message}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("{backend} {operation} failed for {resource}: {source}")]
    Backend {
        backend: &'static str,
        operation: &'static str,
        resource: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::DeploymentNotFound(_)
            | AdapterError::PackageNotFound(_)
            | AdapterError::RevisionNotFound { .. } => ErrorKind::NotFound,
            AdapterError::Validation { .. } => ErrorKind::Validation,
            AdapterError::Unsupported { .. } => ErrorKind::Unsupported,
            AdapterError::Backend { .. } => ErrorKind::Backend,
            AdapterError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AdapterError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(
        backend: &'static str,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        AdapterError::Unsupported {
            backend,
            operation,
            message: message.into(),
        }
    }

    pub fn backend<E>(
        backend: &'static str,
        operation: &'static str,
        resource: impl Into<String>,
        source: E,
    ) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        AdapterError::Backend {
            backend,
            operation,
            resource: resource.into(),
            source: Arc::new(source),
        }
    }

    /// Backend error from a plain message, for malformed responses.
    pub fn malformed(
        backend: &'static str,
        operation: &'static str,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AdapterError::backend(backend, operation, resource, MalformedResponse(message.into()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed response: {0}")]
pub struct MalformedResponse(pub String);
