//! Unified error handling for the phone bill benchmark
//!
//! Every failure in the engine is an `AppError`. Retry loops never inspect
//! messages; they ask the error for its [`ErrorKind`].

use thiserror::Error;

/// Whether a failed unit of work may be retried as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Serialization or lock conflict, resolved by rollback and retry
    Retriable,
    /// Everything else
    Fatal,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Transaction Errors ====================
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Retry limit exceeded after {attempts} attempts: {source}")]
    RetryOver {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    // ==================== Database Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    // ==================== Data Errors ====================
    #[error("Negative time: {0}")]
    NegativeCallTime(i32),

    #[error("Unexpected row count: expected {expected}, actual {actual} ({context})")]
    UnexpectedRowCount {
        expected: u64,
        actual: u64,
        context: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    // ==================== Batch Errors ====================
    #[error("Calculation failed for contract {phone_number}: {source}")]
    CalculationFailed {
        phone_number: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    // ==================== Configuration Errors ====================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classifies the error for retry decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::SerializationFailure(_) => ErrorKind::Retriable,
            _ => ErrorKind::Fatal,
        }
    }

    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Retriable
    }

    /// Returns a stable code for logs and reports
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::SerializationFailure(_) => "serialization_failure",
            AppError::Transaction(_) => "transaction_error",
            AppError::RetryOver { .. } => "retry_over",
            AppError::Database(_) => "database_error",
            AppError::Connection(_) => "connection_error",
            AppError::NegativeCallTime(_) => "negative_call_time",
            AppError::UnexpectedRowCount { .. } => "unexpected_row_count",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::InvalidData(_) => "invalid_data",
            AppError::CalculationFailed { .. } => "calculation_failed",
            AppError::WorkerPanicked(_) => "worker_panicked",
            AppError::Config(_) => "config_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Wraps this error with the phone number of the contract being billed
    pub fn for_contract(self, phone_number: impl Into<String>) -> Self {
        AppError::CalculationFailed {
            phone_number: phone_number.into(),
            source: Box::new(self),
        }
    }
}

// ==================== From implementations ====================

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// SQLSTATE codes that PostgreSQL raises for serialization failures and deadlocks
const RETRIABLE_SQLSTATES: &[&str] = &["40001", "40P01"];

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let retriable = db_err
                    .code()
                    .map(|code| RETRIABLE_SQLSTATES.contains(&&*code))
                    .unwrap_or(false);
                if retriable {
                    AppError::SerializationFailure(db_err.message().to_string())
                } else {
                    AppError::Database(err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AppError::Connection(err.to_string())
            }
            _ => AppError::Database(err.to_string()),
        }
    }
}
