//! Control plane, driver and document store error types

use thiserror::Error;

/// Errors raised by the external collaborators
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(i64),

    #[error("Document {id} was modified concurrently (expected version {expected}, found {found})")]
    StaleVersion { id: i64, expected: u64, found: u64 },

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether a retry of the same call may succeed. Store integrity
    /// failures are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::ResourceNotFound(_)
                | CloudError::ApiError(_)
                | CloudError::CommandFailed(_)
                | CloudError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
