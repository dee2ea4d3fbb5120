//! Error types for the action injector

use thiserror::Error;

/// Main error type for the injector
#[derive(Error, Debug)]
pub enum InjectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error for endpoint {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Account error: {0}")]
    Account(String),

    #[error("Key file error: {0}")]
    KeyFile(#[from] std::io::Error),

    #[error("Nonce query failed for {address}: {message}")]
    NonceQuery { address: String, message: String },

    #[error("Nonce resync failed for {address}: {message}")]
    NonceResync { address: String, message: String },

    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Receipt error: {0}")]
    Receipt(String),

    #[error("Receipt for action {action_id} not available yet")]
    ReceiptPending { action_id: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InjectorError {
    /// Check if error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InjectorError::Connection { .. }
                | InjectorError::NonceQuery { .. }
                | InjectorError::Submission(_)
                | InjectorError::Receipt(_)
                | InjectorError::ReceiptPending { .. }
                | InjectorError::Timeout { .. }
        )
    }
}

/// Result type for injector operations
pub type InjectorResult<T> = Result<T, InjectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_failure_is_not_retried() {
        let err = InjectorError::NonceResync {
            address: "0xabc".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_submission_failure_is_recoverable() {
        let err = InjectorError::Submission("nonce too low".to_string());
        assert!(err.is_retryable());
    }
}
