//! Error types for the common library.
//!
//! This module provides a unified error hierarchy using `thiserror` for consistent
//! error handling across the server, its provider adapters and its storage layer.
//!
//! # Error Categories
//!
//! - `ConfigError`: Missing or invalid configuration
//! - `AuthError`: Google credential failures
//! - `ProviderError`: A single failed provider call, classified as transient or permanent
//! - `StorageError`: Artifact store failures (includes the path and operation)
//! - `CacheError`: Cache backend failures (never fatal to a request)
//! - `Error::Validation`: Input validation failures, tagged with the offending field
//! - `Error::UnknownModel` / `Error::NoDefaultAvailable`: Model resolution failures
//! - `Error::ProviderFailed`: Provider error after retries were exhausted

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for the common library.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (missing env vars, invalid values)
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Authentication errors (credentials missing, token refresh failures)
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Input validation errors
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// Name of the request field that failed validation
        field: String,
        /// Human readable reason
        message: String,
    },

    /// The requested model is not registered or its provider is disabled
    #[error("Unknown model '{model}'. Available models: {}", join_or_none(.available))]
    UnknownModel {
        /// The name the caller asked for
        model: String,
        /// Models that are currently available
        available: Vec<String>,
    },

    /// No model was requested and the configured default is unavailable
    #[error("No model requested and the default model '{model}' is not available")]
    NoDefaultAvailable {
        /// The configured default model
        model: String,
    },

    /// The resolved model does not support the requested operation
    #[error("Model '{model}' does not support {operation}")]
    UnsupportedOperation {
        /// Resolved model id
        model: String,
        /// Operation name ("generate" or "edit")
        operation: String,
    },

    /// Two providers tried to register the same model id
    #[error("Model '{model_id}' is already registered by provider '{existing_provider}', cannot register it for '{provider}'")]
    DuplicateModel {
        /// Colliding model id or alias
        model_id: String,
        /// Provider that owns the model
        existing_provider: String,
        /// Provider that attempted the registration
        provider: String,
    },

    /// A provider call failed permanently or ran out of retries
    #[error("Provider '{provider}' failed after {attempts} attempt(s): {source}")]
    ProviderFailed {
        /// Provider id
        provider: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error returned by the provider
        source: ProviderError,
    },

    /// Artifact store errors
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Cache backend errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// File system I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Unexpected internal failures (task panics, poisoned state)
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error produced once and handed to several waiters
    #[error(transparent)]
    Shared(Arc<Error>),
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "none".to_string()
    } else {
        values.join(", ")
    }
}

impl Error {
    /// Create a new validation error for a named field.
    ///
    /// # Example
    ///
    /// ```
    /// use imagegen_mcp_common::error::Error;
    ///
    /// let err = Error::validation("prompt", "prompt cannot be empty");
    /// assert!(err.to_string().contains("prompt cannot be empty"));
    /// assert!(err.to_string().contains("'prompt'"));
    /// ```
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new unsupported operation error.
    pub fn unsupported(model: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            model: model.into(),
            operation: operation.into(),
        }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Recover an owned error from one shared between several waiters.
    ///
    /// The last holder gets the original error back; everyone else gets
    /// `Error::Shared` wrapping it.
    pub fn from_shared(shared: Arc<Error>) -> Self {
        Arc::try_unwrap(shared).unwrap_or_else(Error::Shared)
    }

    /// Returns the error behind any `Shared` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// True for errors caused by the caller's request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root(),
            Error::Validation { .. }
                | Error::UnknownModel { .. }
                | Error::NoDefaultAvailable { .. }
                | Error::UnsupportedOperation { .. }
        )
    }

    /// True when the error means a requested artifact does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::Storage(StorageError::NotFound(_)) | Error::Storage(StorageError::InvalidId(_))
        )
    }

    /// Name of the request state machine's terminal failure state for this error.
    pub fn terminal_state(&self) -> &'static str {
        match self.root() {
            Error::Validation { .. } | Error::UnsupportedOperation { .. } => "validation_failed",
            Error::UnknownModel { .. } | Error::NoDefaultAvailable { .. } => "model_unavailable",
            Error::ProviderFailed { .. } | Error::Auth(_) => "provider_failed",
            Error::Storage(_) | Error::Io(_) => "storage_failed",
            _ => "internal_error",
        }
    }
}

/// Configuration errors.
///
/// These errors occur when loading or validating configuration from
/// environment variables or model definition files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set
    #[error("Required environment variable {0} is not set")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// A model definition file could not be read or parsed
    #[error("Invalid model definition {path}: {message}")]
    ModelDefinition {
        /// File that failed to load
        path: PathBuf,
        /// Parse or read error
        message: String,
    },
}

impl ConfigError {
    /// Create a new missing environment variable error.
    pub fn missing_env_var(name: impl Into<String>) -> Self {
        ConfigError::MissingEnvVar(name.into())
    }

    /// Create a new invalid value error.
    pub fn invalid_value(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue(name.into(), reason.into())
    }
}

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// HTTP 429 or a provider quota signal
    RateLimited,
    /// HTTP 5xx
    Server,
    /// The call did not complete within its deadline
    Timeout,
    /// Connection could not be established or was reset
    Network,
    /// The provider rejected the request as malformed
    BadRequest,
    /// The prompt or image was refused by the provider's safety system
    ContentPolicy,
    /// Credentials were missing, expired or rejected
    Authentication,
    /// The provider answered with something we could not interpret
    InvalidResponse,
    /// The provider does not implement the operation
    Unsupported,
}

impl ProviderErrorKind {
    /// Transient kinds are worth retrying; everything else surfaces immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Server
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Server => "server_error",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Network => "network_error",
            ProviderErrorKind::BadRequest => "bad_request",
            ProviderErrorKind::ContentPolicy => "content_policy",
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::InvalidResponse => "invalid_response",
            ProviderErrorKind::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// A single failed provider call.
#[derive(Debug, Clone, Error)]
#[error("{provider} {kind}{}: {message}", status_suffix(.status))]
pub struct ProviderError {
    /// Provider id
    pub provider: String,
    /// Failure classification
    pub kind: ProviderErrorKind,
    /// HTTP status, when the provider answered at all
    pub status: Option<u16>,
    /// Provider message or transport error text
    pub message: String,
    /// Server-requested delay before retrying
    pub retry_after: Option<Duration>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Body fragments providers use when refusing content.
const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "safety",
    "moderation_blocked",
    "responsible ai",
];

impl ProviderError {
    /// Create a new provider error without HTTP context.
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify a non-success HTTP response.
    ///
    /// # Example
    ///
    /// ```
    /// use imagegen_mcp_common::error::{ProviderError, ProviderErrorKind};
    ///
    /// let err = ProviderError::from_status("openai", 503, "upstream overloaded");
    /// assert_eq!(err.kind, ProviderErrorKind::Server);
    /// assert!(err.is_retryable());
    ///
    /// let err = ProviderError::from_status("openai", 400, "invalid size");
    /// assert!(!err.is_retryable());
    /// ```
    pub fn from_status(provider: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let lowered = body.to_lowercase();
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            408 => ProviderErrorKind::Timeout,
            401 | 403 => ProviderErrorKind::Authentication,
            400 | 422 if CONTENT_POLICY_MARKERS.iter().any(|m| lowered.contains(m)) => {
                ProviderErrorKind::ContentPolicy
            }
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::BadRequest,
        };
        Self {
            provider: provider.into(),
            kind,
            status: Some(status),
            message: body,
            retry_after: None,
        }
    }

    /// Attach a server-requested retry delay.
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Whether the retry policy should try this call again.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Artifact store operation type for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    /// Writing image bytes or metadata
    Write,
    /// Reading image bytes or metadata
    Read,
    /// Listing date directories
    List,
    /// Removing an artifact
    Delete,
}

impl std::fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageOperation::Write => write!(f, "write"),
            StorageOperation::Read => write!(f, "read"),
            StorageOperation::List => write!(f, "list"),
            StorageOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Artifact store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No committed artifact exists for the id
    #[error("Image not found: {0}")]
    NotFound(String),

    /// The id is not a well-formed image id
    #[error("Invalid image id: {0}")]
    InvalidId(String),

    /// A filesystem operation failed
    #[error("Storage {operation} failed for {}: {source}", .path.display())]
    Io {
        /// The operation being performed
        operation: StorageOperation,
        /// The path being accessed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Sidecar metadata could not be decoded
    #[error("Corrupt metadata for {image_id}: {message}")]
    Metadata {
        /// Artifact id
        image_id: String,
        /// Decode error
        message: String,
    },
}

impl StorageError {
    /// Create a new I/O error with full context.
    ///
    /// # Example
    ///
    /// ```
    /// use imagegen_mcp_common::error::{StorageError, StorageOperation};
    ///
    /// let err = StorageError::io(
    ///     StorageOperation::Write,
    ///     "/var/images/2025/01/01/img.png",
    ///     std::io::Error::other("disk full"),
    /// );
    /// assert!(err.to_string().contains("write"));
    /// assert!(err.to_string().contains("/var/images"));
    /// ```
    pub fn io(
        operation: StorageOperation,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        StorageError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }
}

/// Cache backend errors.
///
/// The request cache logs these and treats the lookup as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached or refused the operation
    #[error("Cache backend '{backend}' error: {message}")]
    Backend {
        /// Backend name ("memory", "redis")
        backend: &'static str,
        /// Error text
        message: String,
    },

    /// A stored entry could not be decoded
    #[error("Cache entry could not be decoded: {0}")]
    Decode(String),
}

impl CacheError {
    /// Create a new backend error.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        CacheError::Backend {
            backend,
            message: message.into(),
        }
    }
}

/// Authentication errors.
///
/// These errors occur while loading Google credentials for Imagen-style providers.
#[derive(Debug, Error)]
pub enum AuthError {
    /// ADC is not configured
    #[error("ADC not configured. Run 'gcloud auth application-default login' or set PROVIDERS__GEMINI__API_KEY to a service account file")]
    NotConfigured,

    /// The configured service account file is unreadable or malformed
    #[error("Invalid credentials file {path}: {message}")]
    CredentialsFile {
        /// Path to the credentials file
        path: String,
        /// Parse or read error
        message: String,
    },

    /// Credentials did not carry a project id and none was configured
    #[error("No Google Cloud project id available; set PROVIDERS__GEMINI__PROJECT_ID")]
    MissingProjectId,

    /// Token refresh failed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl AuthError {
    /// Create a new token refresh failed error.
    pub fn refresh_failed(message: impl Into<String>) -> Self {
        AuthError::RefreshFailed(message.into())
    }
}

/// Result type alias using the unified Error type.
pub type Result<T> = std::result::Result<T, Error>;
