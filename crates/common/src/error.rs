//! Error types for the vCloud plugin

use thiserror::Error;

/// Result type alias using the plugin Error
pub type Result<T> = std::result::Result<T, Error>;

/// Exceptions raised by the remote cloud-directory API.
///
/// The display strings matter: the error classifier matches on them, and they
/// mirror what the provider actually reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Status code: 400/{}, {}", display_opt(.minor_code), display_opt(.message))]
    BadRequest {
        minor_code: Option<String>,
        message: Option<String>,
    },

    #[error("Access forbidden: {0}")]
    AccessForbidden(String),

    #[error("Missing link: {0}")]
    MissingLink(String),

    #[error("Internal server error: {0}")]
    InternalServer(String),

    /// The remote task reached a terminal state but reported a failure.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Client-side failure inside the SDK layer.
    #[error("{0}")]
    Sdk(String),

    /// The response did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

fn display_opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("None")
}

impl ProviderError {
    /// A bad request carrying a provider message.
    pub fn bad_request(minor_code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::BadRequest {
            minor_code: Some(minor_code.into()),
            message: Some(message.into()),
        }
    }

    /// The bare 400 the provider sometimes returns with no body at all.
    pub fn empty_bad_request() -> Self {
        ProviderError::BadRequest {
            minor_code: None,
            message: None,
        }
    }

    /// Short label for the exception type, used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProviderError::EntityNotFound(_) => "EntityNotFound",
            ProviderError::NotFound(_) => "NotFound",
            ProviderError::BadRequest { .. } => "BadRequest",
            ProviderError::AccessForbidden(_) => "AccessForbidden",
            ProviderError::MissingLink(_) => "MissingLink",
            ProviderError::InternalServer(_) => "InternalServer",
            ProviderError::TaskFailed(_) => "TaskFailed",
            ProviderError::Sdk(_) => "Sdk",
            ProviderError::InvalidResponse(_) => "InvalidResponse",
        }
    }
}

/// Plugin error types
#[derive(Error, Debug)]
pub enum Error {
    /// A provider error no classifier predicate claimed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The orchestrator should re-invoke the same operation later.
    #[error("Operation retry requested: {0}")]
    Retry(String),

    /// The workflow execution cannot proceed.
    #[error("Non-recoverable error: {0}")]
    NonRecoverable(String),

    #[error("Required client config key \"{0}\" not provided.")]
    MissingConfigKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the orchestrator should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retry(_))
    }

    /// Whether the failure aborts the workflow execution.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bad_request_display() {
        let err = ProviderError::empty_bad_request();
        assert_eq!(err.to_string(), "Status code: 400/None, None");
    }

    #[test]
    fn test_bad_request_display_with_message() {
        let err = ProviderError::bad_request("DUPLICATE_NAME", "The name net1 is in use");
        assert_eq!(
            err.to_string(),
            "Status code: 400/DUPLICATE_NAME, The name net1 is in use"
        );
    }

    #[test]
    fn test_retry_is_not_fatal() {
        assert!(Error::Retry("busy".to_string()).is_retryable());
        assert!(!Error::Retry("busy".to_string()).is_fatal());
        assert!(Error::NonRecoverable("gone".to_string()).is_fatal());
        assert!(Error::MissingConfigKey("org".to_string()).is_fatal());
    }
}
