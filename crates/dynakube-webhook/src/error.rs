//! Webhook error type

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The namespace label points at a DynaKube that does not exist
    #[error("namespace '{namespace}' is assigned to DynaKube instance '{dynakube}' but it doesn't exist")]
    MissingDynakube {
        /// Namespace of the admitted object
        namespace: String,
        /// DynaKube named by the instance label
        dynakube: String,
    },

    /// The init or endpoint secret is missing and could not be created
    #[error("secrets for namespace '{namespace}' are not available, will retry: {source}")]
    SecretUnavailable {
        /// Namespace lacking the secrets
        namespace: String,
        /// Underlying failure
        #[source]
        source: dynakube_common::Error,
    },

    /// A Kubernetes read or write failed
    #[error("kubernetes API error, will retry: {0}")]
    Kube(#[from] dynakube_common::Error),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TLS material could not be loaded
    #[error("TLS config error: {0}")]
    Tls(String),

    /// The HTTPS server failed
    #[error("server error: {0}")]
    Server(String),
}

impl WebhookError {
    /// Short reason label for denial metrics
    pub fn denial_reason(&self) -> &'static str {
        match self {
            Self::MissingDynakube { .. } => "missing_dynakube",
            Self::SecretUnavailable { .. } => "secret_unavailable",
            Self::InvalidReview(_) => "invalid_review",
            _ => "internal",
        }
    }
}
