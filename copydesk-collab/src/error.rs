//! Error kinds surfaced by every collaboration operation.
//!
//! All errors are raised at the point of violation and never retried
//! internally. Delivery failures to individual recipients are not errors;
//! the broadcast hub swallows and logs them.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

pub type CollabResult<T> = Result<T, CollabError>;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Unknown session, comment, or workflow.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Session/user mismatch or missing permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed comment or operation payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unsupported edit kind.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Workflow decision outside the current step's vocabulary, or a
    /// decision against a retired workflow.
    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable snake_case name of the error kind.
    ///
    /// Reported to the instrumentation hook and sent as the `code` of
    /// `error` wire messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InvalidDecision(_) => "invalid_decision",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Storage(_) => "storage_error",
            Self::Protocol(_) => "protocol_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(CollabError::not_found("session", "s1").kind(), "not_found");
        assert_eq!(CollabError::Forbidden("x".into()).kind(), "forbidden");
        assert_eq!(CollabError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(CollabError::InvalidOperation("x".into()).kind(), "invalid_operation");
        assert_eq!(CollabError::InvalidDecision("x".into()).kind(), "invalid_decision");
        assert_eq!(CollabError::already_exists("workflow", "c1").kind(), "already_exists");
    }

    #[test]
    fn test_error_display() {
        let err = CollabError::not_found("comment", "abc");
        assert_eq!(err.to_string(), "comment not found: abc");

        let err: CollabError = StoreError::DatabaseError("boom".into()).into();
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.kind(), "storage_error");
    }
}
