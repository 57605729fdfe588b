//! Error types for the DynaKube operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Outer layers (reconcile loop, admission handlers) classify errors only
//! through the typed predicates on [`Error`], never by parsing messages.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for DynaKube operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid DynaKube configuration
    #[error("validation error for {dynakube}: {message}")]
    Validation {
        /// Name of the DynaKube with invalid configuration
        dynakube: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.apiUrl")
        field: Option<String>,
    },

    /// A namespace is claimed by more than one application-injecting DynaKube
    #[error("namespace '{namespace}' is claimed by multiple DynaKubes: {}", dynakubes.join(", "))]
    Conflict {
        /// The contested namespace
        namespace: String,
        /// DynaKubes claiming it, current owner first
        dynakubes: Vec<String>,
    },

    /// Dynatrace tenant API error
    #[error("backend error: {message}")]
    Backend {
        /// Description of what failed
        message: String,
        /// HTTP status code, if the server answered
        status: Option<u16>,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A referenced object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of the missing object (e.g., "Secret")
        kind: String,
        /// Name, qualified with the namespace where relevant
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The payload being serialized (if known)
        kind: Option<String>,
    },

    /// Filesystem error
    #[error("io error at {path}: {message}")]
    Io {
        /// Description of what failed
        message: String,
        /// Path involved in the operation
        path: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "mapper", "initgen")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            dynakube: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with DynaKube context
    pub fn validation_for(dynakube: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            dynakube: dynakube.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with DynaKube context and field path
    pub fn validation_for_field(
        dynakube: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            dynakube: dynakube.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a namespace conflict error
    pub fn conflict(namespace: impl Into<String>, dynakubes: Vec<String>) -> Self {
        Self::Conflict {
            namespace: namespace.into(),
            dynakubes,
        }
    }

    /// Create a retryable backend error without a status code
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            status: None,
            retryable: true,
        }
    }

    /// Create a backend error from an HTTP status
    ///
    /// 5xx and 429 are retryable, other statuses are not.
    pub fn backend_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            status: Some(status),
            retryable: status >= 500 || status == 429,
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with payload context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an io error for the given path
    pub fn io(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Io {
            message: msg.into(),
            path: path.into(),
        }
    }

    /// Create an internal error with the given message
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

    /// Check if this error is retryable
    ///
    /// Validation, conflict and serialization errors need a spec change.
    /// Kubernetes errors are retryable unless the API server answered 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Conflict { .. } => false,
            Error::Backend { retryable, .. } => *retryable,
            Error::NotFound { .. } => true,
            Error::Serialization { .. } => false,
            Error::Io { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True for a namespace ownership conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True for an optimistic-concurrency conflict reported by the API server
    pub fn is_resource_version_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True when a referenced object is missing
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True when the tenant API failed
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend { .. })
    }

    /// Get the DynaKube name if this error is associated with one
    pub fn dynakube(&self) -> Option<&str> {
        match self {
            Error::Validation { dynakube, .. } => Some(dynakube),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
