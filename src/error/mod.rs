//! Error taxonomy for the build-and-publish pipeline.
//!
//! Every fallible operation in the crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, BuildError>`. `BuildError` covers transport
//! failures (retried internally by the registry client, see
//! [`crate::registry::transport`]) as well as the semantic failures a step
//! in the pipeline can raise.

pub mod handlers;

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// A single error returned by the registry in a `{errors:[{code,message,detail}]}`
/// response body (OCI distribution spec error format).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistryErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidImageReference { reference: String, reason: String },

    #[error("unauthorized against {registry}/{repository}")]
    RegistryUnauthorized { registry: String, repository: String },

    #[error("registry authentication failed: {0}")]
    RegistryAuthenticationFailed(String),

    #[error("registry returned an error for {operation}: {entries:?}")]
    RegistryError {
        operation: String,
        status: u16,
        entries: Vec<RegistryErrorEntry>,
    },

    #[error("unknown manifest media type: {0}")]
    UnknownManifestFormat(String),

    #[error("container config lists {config_count} diff-ids but manifest lists {manifest_count} layers")]
    LayerCountMismatch {
        config_count: usize,
        manifest_count: usize,
    },

    #[error("layer with digest {0} is already present in this image")]
    DuplicateLayer(String),

    #[error("property {property} is not available on a {variant} layer")]
    LayerPropertyNotFound { variant: &'static str, property: &'static str },

    #[error("expected blob digest {expected} but received {actual}")]
    UnexpectedBlobDigest { expected: String, actual: String },

    #[error("cache at {path} is corrupted: {reason}")]
    CacheCorrupted { path: PathBuf, reason: String },

    #[error("timed out waiting for cache lock on key {0}")]
    CacheLockTimeout(String),

    #[error("credential helper not found: {0}")]
    CredentialHelperNotFound(String),

    #[error("no server URL configured for credential lookup")]
    ServerUrlNotFound,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("multiple errors occurred: {0}")]
    Multi(MultiError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Wraps a batch of failed dependency errors for `BuildError::Multi`.
#[derive(Debug, Clone)]
pub struct MultiError(pub Vec<BuildError>);

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{joined}")
    }
}

impl BuildError {
    /// True for errors a caller might reasonably retry (transport-level).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::Network(_) | BuildError::Timeout(_))
    }

    /// Folds a list of fallible results into a single `Multi` error if any
    /// failed, used by the DAG executor's `when_all` combinator.
    pub fn aggregate(errors: Vec<BuildError>) -> Option<BuildError> {
        match errors.len() {
            0 => None,
            1 => errors.into_iter().next(),
            _ => Some(BuildError::Multi(MultiError(errors))),
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => BuildError::Timeout(err.to_string()),
            _ => BuildError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Parse(format!("JSON: {err}"))
    }
}

impl From<reqwest::Error> for BuildError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BuildError::Timeout(err.to_string())
        } else if err.is_connect() {
            BuildError::Network(format!("connection failed: {err}"))
        } else if err.is_decode() {
            BuildError::Parse(format!("response decode error: {err}"))
        } else {
            BuildError::Network(err.to_string())
        }
    }
}

impl From<url::ParseError> for BuildError {
    fn from(err: url::ParseError) -> Self {
        BuildError::Validation(format!("invalid URL: {err}"))
    }
}
