//! Error types for dspp.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dspp operations.
pub type Result<T> = std::result::Result<T, DsppError>;

/// Main error type for dspp.
#[derive(Error, Debug)]
pub enum DsppError {
    // Document errors
    #[error("Parsing failure in {path:?}: {reason}")]
    ParseFailure { path: PathBuf, reason: String },

    #[error("Interpolation of '{leaf}' did not settle after {depth} substitutions")]
    InterpolationDepth { leaf: String, depth: usize },

    #[error("{path} not found in stack")]
    UpdatePathNotFound { path: String },

    // Descriptor errors
    #[error("No body for '{name}' (declared in {fragment:?})")]
    MissingContent { name: String, fragment: PathBuf },

    #[error("Invalid descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("Bundle '{bundle}' references unknown descriptor '{reference}'")]
    UnknownBundleSource { bundle: String, reference: String },

    #[error("No generator registered for '{name}'")]
    UnknownGenerator { name: String },

    #[error("Circular dependency detected between descriptors: {descriptors:?}")]
    CircularDependency { descriptors: Vec<String> },

    #[error("Command for '{name}' exited with {status}: {stderr}")]
    ExecFailed { name: String, status: String, stderr: String },

    #[error("Serialization failed: {reason}")]
    SerializeFailed { reason: String },

    // File system errors
    #[error("Path {path:?} escapes project root {root:?}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("File read error: {path}: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Remote errors
    #[error("Could not authenticate against {backend}: {reason}")]
    RemoteAuthFailure { backend: String, reason: String },

    #[error("Control plane request {path} failed ({status:?}): {reason}")]
    RemoteUnavailable { path: String, status: Option<u16>, reason: String },

    // Reconciliation errors
    #[error("Change detected, please plan again before applying")]
    StaleApproval,

    #[error("Stack deployed but state could not be written for: {entities:?}")]
    PartialDeploy { entities: Vec<String> },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DsppError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// Whether the caller can recover by planning again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StaleApproval)
    }
}
