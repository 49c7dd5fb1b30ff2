//! Error types for the data plane

use kafka_eventing_contract::ContractError;
use thiserror::Error;

/// Errors that can occur in the data-plane contract pipeline
#[derive(Error, Debug)]
pub enum DataPlaneError {
    /// `start` was called on a watcher that is already running. A second
    /// watch loop on the same source could double-apply and reorder
    /// generations, so this is always a caller bug.
    #[error("contract watcher already started")]
    AlreadyStarted,

    /// The component was used after `close`
    #[error("contract watcher is closed")]
    Closed,

    /// Contract decoding or source access failed
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    /// File system watch could not be established
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Result type for data-plane operations
pub type Result<T> = std::result::Result<T, DataPlaneError>;

impl DataPlaneError {
    /// Programming-contract violations that must never be retried
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, DataPlaneError::AlreadyStarted | DataPlaneError::Closed)
    }
}
