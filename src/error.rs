//! Error types for the Evolver tuning scheduler
//!
//! This module provides the crate-wide error using thiserror for structured
//! error definitions; anyhow is only used at the binary edge.

use crate::genome::LifecycleState;
use thiserror::Error;

/// Main error type for Evolver operations
#[derive(Error, Debug)]
pub enum EvolverError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Lifecycle move not permitted by the state machine
    #[error("Invalid lifecycle transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry snapshot could not be written; the mutation was not applied
    #[error("Registry snapshot failed: {0}")]
    SnapshotFailed(String),

    /// Candidate evaluation failed after retries and fallbacks
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Malformed request or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A promotion decision has already been recorded for the candidate
    #[error("Promotion already decided for {0}")]
    AlreadyDecided(String),

    /// The scheduler no longer accepts work
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Evolver operations
pub type Result<T> = std::result::Result<T, EvolverError>;

/// Convert anyhow::Error to EvolverError
impl From<anyhow::Error> for EvolverError {
    fn from(err: anyhow::Error) -> Self {
        EvolverError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvolverError::NotFound("zooid-7".to_string());
        assert_eq!(err.to_string(), "Not found: zooid-7");
    }

    #[test]
    fn test_transition_display() {
        let err = EvolverError::InvalidTransition {
            name: "z1".to_string(),
            from: LifecycleState::Pruned,
            to: LifecycleState::Active,
        };
        assert_eq!(
            err.to_string(),
            "Invalid lifecycle transition for z1: pruned -> active"
        );
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json");
        let err: EvolverError = json_err.unwrap_err().into();
        assert!(matches!(err, EvolverError::Serialization(_)));
    }
}
