//! Error types for cluster lifecycle operations

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum InstallerError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command `{command}` failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{0}")]
    HealthCheck(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid cluster config: {0}")]
    ConfigParse(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<serde_json::Error> for InstallerError {
    fn from(err: serde_json::Error) -> Self {
        InstallerError::Serialization(err.to_string())
    }
}

impl InstallerError {
    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, InstallerError::NotFound(_))
    }

    /// Check if this is a validation error on the caller's input
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, InstallerError::InvalidArgument(_))
    }

    /// Check if this is a precondition failure (e.g. unhealthy cluster)
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, InstallerError::PreconditionFailed(_))
    }

    /// Check if this is a fatal health probe exhaustion
    pub fn is_health_check(&self) -> bool {
        matches!(self, InstallerError::HealthCheck(_))
    }

    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, InstallerError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, InstallerError>;
