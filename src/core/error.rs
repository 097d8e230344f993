use super::domain::{DomainError, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Tenant missing from context")]
    TenantMissing,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Transaction handle is closed")]
    HandleClosed,

    #[error("Transaction session is locked by a live session guard")]
    HandleBusy,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Transaction is not running on the {0} engine")]
    EngineMismatch(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Domain classification of this error, if it carries one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            DbError::Domain(err) => Some(err.code()),
            _ => None,
        }
    }

    /// Returns true when the error is a domain error with the given code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Engine(EngineError::from(err))
    }
}

/// Raw storage-engine signal, independent of the backend that produced it.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no rows returned by a query that expected to return at least one row")]
    RowNotFound,

    #[error("database error {code}: {message}")]
    Database { code: String, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("pool timed out while waiting for an open connection")]
    PoolTimedOut,

    #[error(transparent)]
    Driver(sqlx::Error),
}

impl EngineError {
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// SQLSTATE of a server-reported error.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            EngineError::Database { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::RowNotFound,
            sqlx::Error::PoolTimedOut => EngineError::PoolTimedOut,
            sqlx::Error::Io(io) => EngineError::Connection(io.to_string()),
            sqlx::Error::Tls(tls) => EngineError::Connection(tls.to_string()),
            sqlx::Error::PoolClosed => EngineError::Connection("pool closed".into()),
            sqlx::Error::Database(db) => EngineError::Database {
                code: db.code().map(|c| c.into_owned()).unwrap_or_default(),
                message: db.message().to_string(),
            },
            other => EngineError::Driver(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_is_classified() {
        let err = EngineError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, EngineError::RowNotFound));
    }

    #[test]
    fn test_pool_timeout_is_classified() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DbError::Engine(EngineError::PoolTimedOut)));
    }

    #[test]
    fn test_code_only_for_domain_errors() {
        assert_eq!(DbError::TenantMissing.code(), None);
        let err: DbError = DomainError::not_found("gone").into();
        assert!(err.is(ErrorCode::NotFound));
        assert!(!err.is(ErrorCode::Conflict));
    }

    #[test]
    fn test_sql_state() {
        let err = EngineError::database("23505", "duplicate key");
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(EngineError::RowNotFound.sql_state(), None);
    }
}
