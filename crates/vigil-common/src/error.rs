//! Error types for the vigil operator
//!
//! Two layers exist. [`Error`] is the structured error returned by the
//! Kubernetes access seams and keeps the underlying cause. [`ReconcileError`]
//! is the flattened, cloneable form that reconcilers record per relation and
//! hand back to the controller runtime.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vigil operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid trait configuration (missing identity labels, bad references)
    #[error("validation error for {trait_name}: {message}")]
    Validation {
        /// Name of the trait with invalid configuration
        trait_name: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "workload", "scrape-config")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a named trait
    pub fn validation_for(trait_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            trait_name: trait_name.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a known resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if this is an API server 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if this is an API server 409 (optimistic concurrency conflict)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Error returned from reconcile functions
///
/// Cloneable so the same failure can be recorded against a relation in the
/// reconcile ledger and surfaced to the controller runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Kubernetes API call failed
    #[error("kube error: {0}")]
    Kube(String),

    /// Trait or workload configuration is invalid
    #[error("validation error: {0}")]
    Validation(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for ReconcileError {
    fn from(e: Error) -> Self {
        match e {
            Error::Kube { source } => Self::Kube(source.to_string()),
            Error::Validation { .. } => Self::Validation(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(e: kube::Error) -> Self {
        Self::Kube(e.to_string())
    }
}
