use crate::error::DatabaseErrorConverter;
use thiserror::Error;

/// Infrastructure error shared by repositories, configuration and the CLI.
///
/// Engine-level failures (lease preconditions, cron parsing, callback
/// failures) live in [`crate::jobs::JobError`] and wrap this type when the
/// cause is a storage problem.
#[derive(Error, Debug)]
pub enum AppError {
    /// Row or record not found
    #[error("Resource not found: {entity} with {field}={value}")]
    NotFound {
        entity: String,
        field: String,
        value: String,
    },

    /// Unique constraint violation
    #[error("Duplicate entry: {entity} already exists ({detail})")]
    Duplicate { entity: String, detail: String },

    /// Validation error with field-specific details
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Database operation error with operation context
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Lock wait timeout, deadlock, serialization failure or a dropped connection
    #[error("Transient database failure during {operation}")]
    Transient {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration error with key information
    #[error("Configuration error: {key}")]
    Configuration {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Connection pool error
    #[error("Connection pool error")]
    ConnectionPool {
        #[source]
        source: anyhow::Error,
    },

    /// Internal error for unexpected failures
    #[error("Internal error")]
    Internal {
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    /// Whether a retry at the next poll cycle is expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Transient { .. } | AppError::ConnectionPool { .. }
        )
    }

    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn pool<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        AppError::ConnectionPool {
            source: anyhow::Error::from(error),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal { source: error }
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(error: diesel::result::Error) -> Self {
        DatabaseErrorConverter::convert_diesel_error(error, "database operation")
    }
}

impl From<crate::config::error::ConfigError> for AppError {
    fn from(error: crate::config::error::ConfigError) -> Self {
        AppError::Configuration {
            key: match &error {
                crate::config::error::ConfigError::ValidationError { field, .. } => field.clone(),
                _ => "settings".to_string(),
            },
            source: anyhow::Error::from(error),
        }
    }
}

/// Type alias for Result with AppError to simplify function signatures
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = AppError::Transient {
            operation: "lease".to_string(),
            source: anyhow::anyhow!("deadlock detected"),
        };
        assert!(err.is_transient());

        let err = AppError::validation("cron", "bad");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_from_anyhow_is_internal() {
        let err: AppError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, AppError::Internal { .. }));
    }

    #[test]
    fn test_config_error_keeps_field() {
        let err: AppError =
            crate::config::error::ConfigError::validation("worker.executor_thread", "zero").into();
        match err {
            AppError::Configuration { key, .. } => assert_eq!(key, "worker.executor_thread"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
