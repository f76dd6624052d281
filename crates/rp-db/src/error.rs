//! Database layer errors

use rp_core::AppError;
use thiserror::Error;

/// An error reported by the database driver, with the diagnostic fields the
/// server provided.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    /// Server error number, e.g. `1062` for a duplicate key
    pub errno: Option<u32>,
    /// Five character SQLSTATE
    pub sql_state: Option<String>,
    /// Symbolic classification of the failure
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            errno: None,
            sql_state: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_errno(mut self, errno: u32) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Error type for database operations
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database pool is required")]
    PoolUnavailable,

    #[error("Connection is already released")]
    ConnectionReleased,

    #[error("Repository `{0}` is not part of the requested scheme")]
    RepositoryNotFound(&'static str),

    #[error("Repository `{0}` is closed")]
    RepositoryClosed(&'static str),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Could not decode row: {0}")]
    Decode(#[from] serde_json::Error),

    /// Request-level errors pass through a business operation unchanged
    #[error(transparent)]
    Request(#[from] AppError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// The message reported to callers when this error is wrapped into a
    /// business call error. Driver errors report the server message only.
    pub fn business_message(&self) -> String {
        match self {
            DbError::Driver(e) => e.message.clone(),
            DbError::Request(e) => e.message().to_string(),
            other => other.to_string(),
        }
    }

    /// The request-level error this error stands for, if it is one.
    /// A repository missing from the scheme is a bad request.
    pub fn request_error(&self) -> Option<AppError> {
        match self {
            DbError::Request(e) => Some(e.clone()),
            DbError::RepositoryNotFound(_) => Some(AppError::bad_request(self.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_builder() {
        let err = DriverError::new("Duplicate entry")
            .with_errno(1062)
            .with_sql_state("23000")
            .with_code("unique_violation");
        assert_eq!(err.errno, Some(1062));
        assert_eq!(err.to_string(), "Duplicate entry");

        let db: DbError = err.into();
        assert_eq!(db.to_string(), "Driver error: Duplicate entry");
        assert_eq!(db.business_message(), "Duplicate entry");
    }

    #[test]
    fn test_request_error_is_transparent() {
        let db: DbError = AppError::not_found("user 7").into();
        assert_eq!(db.to_string(), "Not found: user 7");
        assert_eq!(db.request_error(), Some(AppError::not_found("user 7")));
    }

    #[test]
    fn test_missing_repository_is_a_bad_request() {
        let db = DbError::RepositoryNotFound("user");
        let app = db.request_error().unwrap();
        assert_eq!(app.status_code(), 400);
        assert!(app.message().contains("user"));
        assert!(DbError::PoolUnavailable.request_error().is_none());
    }
}
