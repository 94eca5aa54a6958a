//! Storage error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    /// The `(category_type, client_id, community_id)` key already exists.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl RepoError {
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, RepoError::ConstraintViolation(_))
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return RepoError::ConstraintViolation(db.message().to_string());
            }
        }
        RepoError::Database(err)
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
