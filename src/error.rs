//! Error types for the registry storage operator
//!
//! Provides structured error types for credential resolution, driver
//! selection, cloud provider calls and multi-item operations that can
//! partially fail.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::crd::StorageBackend;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Credential Errors
    // =========================================================================
    #[error("secret {secret:?} does not contain required key {key:?}")]
    MissingSecretKey { secret: String, key: String },

    #[error("no credentials found for {backend}: neither {user_secret:?} nor {minted_secret:?} exist")]
    CredentialsNotFound {
        backend: StorageBackend,
        user_secret: String,
        minted_secret: String,
    },

    // =========================================================================
    // Driver Selection Errors
    // =========================================================================
    #[error("storage not configured")]
    StorageNotConfigured,

    #[error("exactly one storage type should be configured, found: {}", .0.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", "))]
    MultipleStorageBackends(Vec<StorageBackend>),

    #[error("Backend unavailable: {backend} ({reason})")]
    BackendUnavailable {
        backend: StorageBackend,
        reason: String,
    },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("{backend} {operation} on {resource} failed ({kind}): {message}")]
    Provider {
        backend: StorageBackend,
        operation: String,
        resource: String,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out after {duration:?} waiting for {what}")]
    Timeout { what: String, duration: Duration },

    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Classification of a cloud provider failure, matched on provider error
/// codes before falling through to the generic path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    NotFound,
    AlreadyExists,
    Forbidden,
    Conflict,
    Throttled,
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::NotFound => write!(f, "not found"),
            ProviderErrorKind::AlreadyExists => write!(f, "already exists"),
            ProviderErrorKind::Forbidden => write!(f, "forbidden"),
            ProviderErrorKind::Conflict => write!(f, "conflict"),
            ProviderErrorKind::Throttled => write!(f, "throttled"),
            ProviderErrorKind::Other => write!(f, "error"),
        }
    }
}

impl ProviderErrorKind {
    /// Map an HTTP status code onto a provider error class
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => ProviderErrorKind::NotFound,
            403 | 401 => ProviderErrorKind::Forbidden,
            409 => ProviderErrorKind::Conflict,
            429 => ProviderErrorKind::Throttled,
            _ => ProviderErrorKind::Other,
        }
    }
}

// =============================================================================
// Partial Failure Aggregation
// =============================================================================

/// One failed item inside a multi-item operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// What was being attempted (e.g. "copy", "bind-tag", "delete-objects")
    pub operation: String,
    /// The resource the operation targeted
    pub resource: String,
    /// Rendered cause
    pub cause: String,
    /// Whether re-running the operation may succeed
    pub retryable: bool,
}

impl OperationFailure {
    pub fn new(operation: impl Into<String>, resource: impl Into<String>, error: &Error) -> Self {
        Self {
            operation: operation.into(),
            resource: resource.into(),
            cause: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.resource, self.cause)
    }
}

/// Failures collected by an operation that keeps going past individual items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateError {
    pub failures: Vec<OperationFailure>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: OperationFailure) {
        self.failures.push(failure);
    }

    pub fn record(&mut self, operation: &str, resource: &str, error: &Error) {
        self.push(OperationFailure::new(operation, resource, error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_retryable(&self) -> bool {
        self.failures.iter().any(|f| f.retryable)
    }

    /// `Ok(())` when nothing failed, the aggregate otherwise
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed: ", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

// =============================================================================
// Error Actions
// =============================================================================

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a provider error
    pub fn provider(
        backend: StorageBackend,
        operation: impl Into<String>,
        resource: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Error::Provider {
            backend,
            operation: operation.into(),
            resource: resource.into(),
            kind,
            message: message.into(),
        }
    }

    /// Provider error class, if this is a provider error
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Error::Provider { kind, .. } => Some(*kind),
            Error::Http(e) => e.status().map(|s| ProviderErrorKind::from_status(s.as_u16())),
            Error::Kube(kube::Error::Api(response)) => {
                Some(ProviderErrorKind::from_status(response.code))
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.provider_kind() == Some(ProviderErrorKind::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        self.provider_kind() == Some(ProviderErrorKind::AlreadyExists)
    }

    pub fn is_forbidden(&self) -> bool {
        self.provider_kind() == Some(ProviderErrorKind::Forbidden)
    }

    pub fn is_conflict(&self) -> bool {
        self.provider_kind() == Some(ProviderErrorKind::Conflict)
    }

    pub fn is_throttled(&self) -> bool {
        self.provider_kind() == Some(ProviderErrorKind::Throttled)
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Throttling - back off harder
            Error::Provider {
                kind: ProviderErrorKind::Throttled,
                ..
            } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Waiting on the cloud to converge
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Partial failure - retry only if something is worth retrying
            Error::Aggregate(agg) if !agg.is_retryable() => ErrorAction::NoRequeue,

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::CredentialsNotFound { .. }
            | Error::MissingSecretKey { .. }
            | Error::StorageNotConfigured
            | Error::MultipleStorageBackends(_)
            | Error::BackendUnavailable { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Http(_)
                | Error::Timeout { .. }
                | Error::Provider {
                    kind: ProviderErrorKind::Throttled,
                    ..
                }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
