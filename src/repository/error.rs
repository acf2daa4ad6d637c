//! Database error taxonomy shared by every query interface backend.

use thiserror::Error;

/// Result type for query interface operations.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Constraint {name} not found on table {table}")]
    ConstraintNotFound { table: String, name: String },
    #[error("Constraint {name} already exists on table {table}")]
    ConstraintAlreadyExists { table: String, name: String },
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),
    #[error("Database error: {0}")]
    Query(String),
}

impl DbError {
    pub fn constraint_not_found(table: &str, name: &str) -> Self {
        DbError::ConstraintNotFound {
            table: table.to_string(),
            name: name.to_string(),
        }
    }

    pub fn constraint_already_exists(table: &str, name: &str) -> Self {
        DbError::ConstraintAlreadyExists {
            table: table.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether the failure came from the connection rather than the statement.
    pub fn is_connection(&self) -> bool {
        matches!(self, DbError::Connection(_))
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(e: tokio::task::JoinError) -> Self {
        DbError::Connection(format!("blocking task failed: {}", e))
    }
}
