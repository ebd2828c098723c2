use crate::error::AppError;
use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// SQLSTATE-derived message fragments Postgres emits for lock contention.
const TRANSIENT_MESSAGES: &[&str] = &[
    "deadlock detected",
    "could not obtain lock",
    "lock timeout",
    "canceling statement due to lock timeout",
    "server closed the connection",
    "terminating connection",
];

/// Utility for converting Diesel errors into [`AppError`] variants.
///
/// Lock contention and lost connections are mapped to
/// [`AppError::Transient`] so the lease protocol can skip a single row
/// instead of abandoning the whole batch.
pub struct DatabaseErrorConverter;

impl DatabaseErrorConverter {
    /// Converts a Diesel error to an appropriate AppError variant.
    pub fn convert_diesel_error(error: DieselError, operation: &str) -> AppError {
        match error {
            DieselError::DatabaseError(kind, info) => {
                Self::convert_database_error(kind, info, operation)
            }
            DieselError::NotFound => AppError::NotFound {
                entity: "row".to_string(),
                field: "id".to_string(),
                value: "unknown".to_string(),
            },
            DieselError::BrokenTransactionManager => AppError::Transient {
                operation: operation.to_string(),
                source: anyhow::anyhow!("transaction manager is broken"),
            },
            other => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::from(other),
            },
        }
    }

    fn convert_database_error(
        kind: DatabaseErrorKind,
        info: Box<dyn diesel::result::DatabaseErrorInformation + Send + Sync>,
        operation: &str,
    ) -> AppError {
        let message = info.message().to_string();

        match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => AppError::Transient {
                operation: operation.to_string(),
                source: anyhow::Error::msg(message),
            },
            DatabaseErrorKind::UniqueViolation => AppError::Duplicate {
                entity: info.table_name().unwrap_or("row").to_string(),
                detail: info.details().unwrap_or(&message).to_string(),
            },
            DatabaseErrorKind::NotNullViolation | DatabaseErrorKind::CheckViolation => {
                AppError::Validation {
                    field: info.column_name().unwrap_or("unknown").to_string(),
                    reason: message,
                }
            }
            _ if Self::is_transient_message(&message) => AppError::Transient {
                operation: operation.to_string(),
                source: anyhow::Error::msg(message),
            },
            _ => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::msg(message),
            },
        }
    }

    /// Returns true when a driver message describes lock contention or a lost connection.
    pub fn is_transient_message(message: &str) -> bool {
        let lower = message.to_lowercase();
        TRANSIENT_MESSAGES.iter().any(|m| lower.contains(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_not_found() {
        let err = DatabaseErrorConverter::convert_diesel_error(DieselError::NotFound, "find");
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[test]
    fn test_rollback_is_plain_database_error() {
        let err = DatabaseErrorConverter::convert_diesel_error(
            DieselError::RollbackTransaction,
            "lease",
        );
        match err {
            AppError::Database { operation, .. } => assert_eq!(operation, "lease"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transient_messages() {
        assert!(DatabaseErrorConverter::is_transient_message(
            "ERROR: deadlock detected"
        ));
        assert!(DatabaseErrorConverter::is_transient_message(
            "canceling statement due to lock timeout"
        ));
        assert!(!DatabaseErrorConverter::is_transient_message(
            "relation \"jobs\" does not exist"
        ));
    }
}
