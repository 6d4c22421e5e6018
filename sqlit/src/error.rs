//! # Error Module
//!
//! A single error type for every fallible operation in sqlit. Driver errors from
//! sqlx are wrapped; everything else describes a mapping or flush failure.

// ============================================================================
// External Crate Imports
// ============================================================================

use sqlx::error::ErrorKind;
use thiserror::Error;

// ============================================================================
// Error Enum
// ============================================================================

/// Errors raised by schema construction, record assignment, query compilation
/// and the flush engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An error reported by the database driver.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The name does not resolve to a field of the model.
    #[error("Invalid field: {model}.{field}")]
    UnknownField { model: String, field: String },

    /// The name does not resolve to a model or table.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Related fields are virtual and cannot be assigned.
    #[error("Not assignable: {model}.{field}")]
    NotAssignable { model: String, field: String },

    /// A foreign key already points at a different record.
    #[error("Reassignment: {model}.{field}")]
    Reassignment { model: String, field: String },

    /// The value cannot be coerced to the column type.
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// The filter document is malformed.
    #[error("Bad filter: {0}")]
    BadFilter(String),

    /// `get` was called with something that is neither a key nor a unique filter.
    #[error("Bad selector: {0}")]
    BadSelector(String),

    /// An insert or create was attempted with no columns.
    #[error("{0}: No data")]
    EmptyData(String),

    /// An upsert document does not carry a complete unique key.
    #[error("Incomplete: {0}")]
    Incomplete(String),

    /// A nested row key traverses a field that is not a foreign key.
    #[error("Not a foreign key: {0}")]
    NotForeignKey(String),

    /// Two unique keys of the same data resolve to different records.
    #[error("Inconsistent unique constraint values")]
    InconsistentUniqueKey,

    /// An update matched no row.
    #[error("Row does not exist")]
    RowNotFound,

    /// A single-record save cannot make progress.
    #[error("Loops in record fields")]
    RecordLoop,

    /// The flush engine stalled on mutually dependent records.
    #[error("Circular references")]
    CircularReferences,

    /// A nested mutation used an operation name that is not supported.
    #[error("Unsupported method '{0}'")]
    UnsupportedMethod(String),

    /// The schema description is inconsistent.
    #[error("Schema error: {0}")]
    Schema(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn unknown_field(model: &str, field: &str) -> Self {
        Error::UnknownField { model: model.to_string(), field: field.to_string() }
    }

    /// Whether the error is a uniqueness/integrity violation.
    ///
    /// The flush engine reacts to these by re-reading the conflicting row
    /// instead of failing.
    pub fn is_integrity(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(e)) => {
                if matches!(e.kind(), ErrorKind::UniqueViolation) {
                    return true;
                }
                let message = e.message().to_lowercase();
                message.contains("duplicate") || message.contains("unique constraint")
            }
            _ => false,
        }
    }

    /// Whether the whole transaction may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(e)) => {
                let message = e.message().to_lowercase();
                message.contains("deadlock") || message.contains("database is locked")
            }
            _ => false,
        }
    }
}
