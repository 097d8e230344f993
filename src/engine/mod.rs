//! Storage-engine collaborators consumed by the transaction manager.
//!
//! A [`ConnectionPool`] hands out [`Session`]s: a pooled connection with an
//! open transaction on it. Savepoints and session settings are ordinary
//! statements issued through [`Session::execute`].

pub mod memory;
pub mod postgres;

use crate::core::EngineError;
use async_trait::async_trait;
use std::any::Any;

#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// Acquire a connection and begin a transaction on it.
    async fn begin(&self) -> Result<Box<dyn Session>, EngineError>;
}

/// A single connection inside an open transaction.
///
/// After `commit` or `rollback` succeeded the session is finished and further
/// `commit`/`rollback` calls are no-ops. Dropping an unfinished session must
/// roll its transaction back.
#[async_trait]
pub trait Session: Send + Any {
    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64, EngineError>;

    /// Run a statement yielding one row with one nullable text column.
    async fn query_text(&mut self, sql: &str) -> Result<Option<String>, EngineError>;

    async fn commit(&mut self) -> Result<(), EngineError>;

    async fn rollback(&mut self) -> Result<(), EngineError>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
