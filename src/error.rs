// Transaction engine error types
use std::time::Duration;
use thiserror::Error;

use crate::types::{OperationId, TransactionId};

/// Failure reported by a mutation command; carried verbatim into commit results
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MutationError {
    #[error("Mutation rejected: {0}")]
    Rejected(String),

    #[error("Mutation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

/// Errors from the query cache layer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry rejected: {0}")]
    Rejected(String),
}

/// Transaction engine errors
#[derive(Debug, Error, Clone)]
pub enum TransactionError {
    // Too many queued operations
    #[error("Transaction capacity exceeded: at most {max} pending operations")]
    CapacityExceeded { max: usize },

    // Cancel while executing, commit with nothing queued, ...
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Operation {operation_id} failed: {source}")]
    MutationFailed {
        operation_id: OperationId,
        #[source]
        source: MutationError,
    },

    #[error("Transaction {0} is already active with a different configuration")]
    AlreadyActive(TransactionId),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl TransactionError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        TransactionError::InvalidState(message.into())
    }

    pub fn mutation_failed(operation_id: OperationId, source: MutationError) -> Self {
        TransactionError::MutationFailed { operation_id, source }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            TransactionError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            TransactionError::InvalidState(_) => "INVALID_STATE",
            TransactionError::MutationFailed { .. } => "MUTATION_FAILED",
            TransactionError::AlreadyActive(_) => "ALREADY_ACTIVE",
            TransactionError::Cache(_) => "CACHE_ERROR",
        }
    }

    /// Get user-facing message
    pub fn message(&self) -> String {
        match self {
            TransactionError::CapacityExceeded { max } => {
                format!("Too many pending changes (limit {}). Save or discard some first.", max)
            }
            TransactionError::InvalidState(msg) => msg.clone(),
            TransactionError::MutationFailed { source, .. } => source.to_string(),
            TransactionError::AlreadyActive(_) => {
                "Another set of pending changes is already open".to_string()
            }
            TransactionError::Cache(err) => err.to_string(),
        }
    }

    /// Whether the error came from a remote mutation rather than the engine itself
    pub fn is_mutation_failure(&self) -> bool {
        matches!(self, TransactionError::MutationFailed { .. })
    }
}

pub type Result<T, E = TransactionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransactionError::CapacityExceeded { max: 3 }.error_code(), "CAPACITY_EXCEEDED");
        assert_eq!(TransactionError::invalid_state("nope").error_code(), "INVALID_STATE");

        let err = TransactionError::mutation_failed(
            OperationId::new(),
            MutationError::Rejected("name is required".to_string()),
        );
        assert_eq!(err.error_code(), "MUTATION_FAILED");
        assert!(err.is_mutation_failure());
        assert_eq!(err.message(), "Mutation rejected: name is required");
    }

    #[test]
    fn test_cache_error_converts() {
        let err: TransactionError = CacheError::Unavailable("offline".to_string()).into();
        assert_eq!(err.error_code(), "CACHE_ERROR");
    }
}
