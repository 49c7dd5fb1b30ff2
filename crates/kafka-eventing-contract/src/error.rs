//! Error types for contract encoding and shared storage access

use thiserror::Error;

/// Errors raised while encoding, decoding or storing a contract
#[derive(Error, Debug)]
pub enum ContractError {
    /// The payload was empty (e.g. a file truncated mid-write)
    #[error("contract payload is empty")]
    EmptyPayload,

    /// The payload could not be parsed into a contract
    #[error("failed to decode contract: {0}")]
    Decode(#[source] serde_json::Error),

    /// The contract could not be serialized
    #[error("failed to encode contract: {0}")]
    Encode(#[source] serde_json::Error),

    /// Shared storage read or write failed
    #[error("contract storage error: {0}")]
    Storage(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for contract operations
pub type Result<T> = std::result::Result<T, ContractError>;

impl ContractError {
    /// Whether the failure is caused by the payload itself rather than by
    /// a transient condition. Retrying a bad payload before the next change
    /// notification cannot succeed.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, ContractError::EmptyPayload | ContractError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_errors() {
        assert!(ContractError::EmptyPayload.is_payload_error());
        assert!(!ContractError::Storage("boom".to_string()).is_payload_error());
    }

    #[test]
    fn test_error_display() {
        let err = ContractError::Storage("configmap not found".to_string());
        assert!(err.to_string().contains("configmap not found"));
    }
}
