/// Error types for the swarm coordination engine.
use thiserror::Error;

/// Core error type for engine operations.
///
/// Variants follow the failure taxonomy the tool surface reports:
/// validation and authorization problems are the caller's fault, conflicts
/// are lost races or exhausted capacity, invalid-state errors are status
/// preconditions that did not hold.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Short sentence shown to the caller on the tool surface.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Whether the error is the caller's fault (validation, auth,
    /// precondition) rather than an internal failure worth logging loudly.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::NotFound(_, _)
                | EngineError::Unauthorized(_)
                | EngineError::Conflict(_)
                | EngineError::InvalidState(_)
        )
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_classified() {
        assert!(EngineError::Validation("bad".into()).is_caller_error());
        assert!(EngineError::NotFound("task", "x".into()).is_caller_error());
        assert!(EngineError::Conflict("already claimed".into()).is_caller_error());
        assert!(!EngineError::Migration("step 3".into()).is_caller_error());
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let err = EngineError::NotFound("agent", "abc".into());
        assert_eq!(err.user_message(), "agent not found: abc");
    }
}
