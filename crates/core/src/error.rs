//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only: bad input and unknown entities.
/// Queue and store failures are infrastructure errors and live in `jobmesh-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. task count out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job or task was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn job_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "task",
            id: id.to_string(),
        }
    }
}
