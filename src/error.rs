use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<StorageError> for AuditError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => Self::StorageUnavailable(msg),
            StorageError::Conflict(msg) | StorageError::Corrupt(msg) => Self::ChainFaulted(msg),
        }
    }
}

/// Errors surfaced by the audit chain engine.
///
/// Tamper findings are not errors: they are reported inside a
/// `VerificationResult`.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit chain is not initialized")]
    NotInitialized,

    #[error("Invalid signing key: {0}")]
    InvalidSigningKey(String),

    #[error("Audit storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Audit chain faulted: {0}")]
    ChainFaulted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuditError {
    /// Whether retrying the same call can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuditError::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(format!("Database error: {}", err))
            }
            sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => Self::Corrupt(format!("Database error: {}", err)),
            _ => Self::Unavailable(format!("Database error: {}", err)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Unavailable(format!("Migration error: {}", err))
    }
}

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O, connection or timeout failure; retryable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The write collided with existing data (duplicate id or sequence).
    #[error("Storage conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded into an entry.
    #[error("Corrupt storage row: {0}")]
    Corrupt(String),
}

pub type AuditResult<T> = Result<T, AuditError>;
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_map_to_engine_errors() {
        let err: AuditError = StorageError::Unavailable("pool timed out".to_string()).into();
        assert!(matches!(err, AuditError::StorageUnavailable(_)));
        assert!(err.is_retryable());

        let err: AuditError = StorageError::Conflict("duplicate sequence".to_string()).into();
        assert!(matches!(err, AuditError::ChainFaulted(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AuditError::InvalidSigningKey("too short".to_string());
        assert!(err.to_string().contains("Invalid signing key"));
        assert!(err.to_string().contains("too short"));
    }
}
