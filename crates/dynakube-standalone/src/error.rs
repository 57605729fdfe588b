//! Init runner error type

use thiserror::Error;

/// Error type of the init runner
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Required environment variables are not set
    #[error("{} environment variables missing: {}", .0.len(), .0.join(", "))]
    MissingEnv(Vec<String>),

    /// An environment variable has a value that cannot be used
    #[error("environment variable {name} is invalid: {reason}")]
    InvalidEnv {
        /// Variable name
        name: String,
        /// What is wrong with the value
        reason: String,
    },

    /// The node is not in the monitoring-node map of the init secret
    #[error("node '{0}' has no host tenant in the init secret")]
    UnknownNode(String),

    /// A runner step failed
    #[error("{step}: {source}")]
    Step {
        /// Step that failed, e.g. "install agent"
        step: &'static str,
        /// Underlying failure
        #[source]
        source: dynakube_common::Error,
    },
}

impl RunnerError {
    /// Wrap a lower-level error with the step it failed in
    pub fn step(step: &'static str, source: dynakube_common::Error) -> Self {
        Self::Step { step, source }
    }
}

/// Attach the failing step to a result
pub trait StepContext<T> {
    /// Map the error into [`RunnerError::Step`]
    fn step(self, step: &'static str) -> Result<T, RunnerError>;
}

impl<T> StepContext<T> for Result<T, dynakube_common::Error> {
    fn step(self, step: &'static str) -> Result<T, RunnerError> {
        self.map_err(|e| RunnerError::step(step, e))
    }
}
