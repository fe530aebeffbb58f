//! Error types for the pod injection webhook

use thiserror::Error;

/// Main error type for injection operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The pod selector configured on the DynaKube could not be parsed
    #[error("invalid pod selector: {0}")]
    Selector(String),

    /// The workload configuration for a pod could not be resolved
    #[error("unable to resolve DynaKube for namespace {namespace}: {message}")]
    Resolution {
        /// Namespace of the pod being admitted
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// A mutator failed while editing the pod
    #[error("{mutator} mutation failed: {message}")]
    Mutation {
        /// Name of the mutator that failed
        mutator: &'static str,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Static webhook configuration is incomplete or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// The HTTPS server failed
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a selector error with the given message
    pub fn selector(msg: impl Into<String>) -> Self {
        Self::Selector(msg.into())
    }

    /// Create a resolution error for the given namespace
    pub fn resolution(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a mutation error attributed to the named mutator
    pub fn mutation(mutator: &'static str, msg: impl Into<String>) -> Self {
        Self::Mutation {
            mutator,
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error must block admission instead of failing open
    ///
    /// Only a malformed selector blocks: it is an operator misconfiguration
    /// that silently skipping every pod would hide.
    pub fn blocks_admission(&self) -> bool {
        matches!(self, Error::Selector(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
