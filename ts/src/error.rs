//! Store error types

use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write referenced a row that does not exist (e.g. an unknown stop)
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Check if this is a foreign key violation
    pub fn is_referential_integrity(&self) -> bool {
        matches!(self, StoreError::ReferentialIntegrity(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                StoreError::ReferentialIntegrity(
                    message.clone().unwrap_or_else(|| "FOREIGN KEY constraint failed".to_string()),
                )
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_failure_is_classified() {
        let failure = rusqlite::ffi::Error {
            code: rusqlite::ErrorCode::ConstraintViolation,
            extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY,
        };
        let err: StoreError = rusqlite::Error::SqliteFailure(failure, None).into();
        assert!(err.is_referential_integrity());
    }

    #[test]
    fn test_other_constraint_failure_is_not_referential() {
        let failure = rusqlite::ffi::Error {
            code: rusqlite::ErrorCode::ConstraintViolation,
            extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL,
        };
        let err: StoreError = rusqlite::Error::SqliteFailure(failure, Some("NOT NULL".to_string())).into();
        assert!(!err.is_referential_integrity());
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
