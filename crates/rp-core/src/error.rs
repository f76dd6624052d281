//! Request-level error types
//!
//! Everything that leaves a business operation is one of these. Raw driver
//! errors never cross this boundary.

use thiserror::Error;

/// Request-level error returned to callers of a business operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// A business callback failed with an error that was not request-level
    #[error("Business Call Error: {message}")]
    BusinessCall { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type for business operations
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest { message: message.into() }
    }

    pub fn business_call(message: impl Into<String>) -> Self {
        AppError::BusinessCall { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound { message: message.into() }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        AppError::Unauthorized { message: message.into() }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AppError::Forbidden { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal { message: message.into() }
    }

    /// The message without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            AppError::BadRequest { message }
            | AppError::BusinessCall { message }
            | AppError::NotFound { message }
            | AppError::Unauthorized { message }
            | AppError::Forbidden { message }
            | AppError::Conflict { message }
            | AppError::Internal { message } => message,
        }
    }

    /// HTTP status code mapping
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest { .. } | AppError::BusinessCall { .. } => 400,
            AppError::Unauthorized { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Internal { .. } => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::BadRequest { .. } => "bad_request",
            AppError::BusinessCall { .. } => "business_call_error",
            AppError::NotFound { .. } => "not_found",
            AppError::Unauthorized { .. } => "unauthorized",
            AppError::Forbidden { .. } => "forbidden",
            AppError::Conflict { .. } => "conflict",
            AppError::Internal { .. } => "internal_error",
        }
    }
}
