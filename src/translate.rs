//! Mapping of storage-engine signals with a clear domain meaning.
//!
//! Only two signals are translated. Everything else (connection failures,
//! unexpected server errors) is returned untouched so the transport layer
//! treats it as an internal failure.

use crate::core::{DbError, DomainError, EngineError, ErrorCode, Result};

/// SQLSTATE reported by PostgreSQL for a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

pub fn translate(err: DbError) -> DbError {
    match err {
        DbError::Engine(EngineError::RowNotFound) => {
            DbError::Domain(DomainError::new(ErrorCode::NotFound, "not found"))
        }
        DbError::Engine(engine @ EngineError::Database { .. })
            if engine.sql_state() == Some(UNIQUE_VIOLATION) =>
        {
            DbError::Domain(DomainError::new(ErrorCode::Conflict, "already exists"))
        }
        other => other,
    }
}

/// [`translate`] lifted over a result; successes pass through.
pub fn translate_result<T>(result: Result<T>) -> Result<T> {
    result.map_err(translate)
}
