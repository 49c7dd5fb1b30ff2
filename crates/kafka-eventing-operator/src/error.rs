//! Error types for the Kafka eventing operator

use kafka_eventing_contract::ContractError;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Contract encoding or shared storage failure
    #[error("Contract error: {0}")]
    ContractError(#[from] ContractError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Consumer group admin operation failed
    #[error("Consumer group operation failed: {0}")]
    ConsumerGroupError(String),

    /// Trust bundle could not be loaded
    #[error("Trust bundle error: {0}")]
    TrustBundleError(String),

    /// Operation used after shutdown
    #[error("Component is closed: {0}")]
    Closed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::KubeError(_) | OperatorError::ConsumerGroupError(_) => true,
            OperatorError::ContractError(e) => !e.is_payload_error(),
            _ => false,
        }
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}
