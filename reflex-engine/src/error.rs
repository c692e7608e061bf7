//! Error types for reflex-engine

use std::time::Duration;

use thiserror::Error;

use crate::types::FireId;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum ReflexError {
    /// Unknown heuristic or fire record
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed input rejected at the boundary (nothing was applied)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Store, cache or collaborator could not be reached
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Reasoner exceeded its time budget
    #[error("Reasoner timed out after {0:?}")]
    ReasonerTimeout(Duration),

    /// Reasoner returned an error
    #[error("Reasoner error: {0}")]
    Reasoner(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Fire record already carries an outcome
    #[error("Fire record already resolved: {0}")]
    FireAlreadyResolved(FireId),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("Schema migration failed: {0}")]
    Migration(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReflexError {
    pub(crate) fn heuristic_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "Heuristic",
            id: id.to_string(),
        }
    }

    pub(crate) fn fire_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "Fire record",
            id: id.to_string(),
        }
    }

    /// Whether the failure means the backing service could not be reached,
    /// as opposed to a problem with the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_) | Self::Io(_))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ReflexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReflexError::Database("connection failed".into());
        assert!(err.to_string().contains("connection failed"));
    }

    #[test]
    fn test_not_found_display() {
        let err = ReflexError::heuristic_not_found("abc");
        assert_eq!(err.to_string(), "Heuristic not found: abc");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ReflexError = io_err.into();
        assert!(matches!(err, ReflexError::Io(_)));
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_invalid_argument_is_not_unavailable() {
        let err = ReflexError::InvalidArgument("magnitude".into());
        assert!(!err.is_unavailable());
    }
}
