use super::{ConnectionPool, Session};
use crate::config::DatabaseConfig;
use crate::core::{DbError, EngineError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Postgres, Transaction};
use std::any::Any;
use tracing::info;

/// Connection pool backed by `sqlx::PgPool`.
#[derive(Clone)]
pub struct PgConnectionPool {
    pool: PgPool,
}

impl PgConnectionPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration and open the minimum connections.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let pool = config
            .pool_options()
            .connect_with(config.connect_options())
            .await?;

        info!(target = %config.to_url(), "PostgreSQL pool connected");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    async fn begin(&self) -> std::result::Result<Box<dyn Session>, EngineError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx: Some(tx) }))
    }
}

/// An open PostgreSQL transaction.
///
/// Dropping an unfinished session lets sqlx queue the rollback on the
/// connection before it is reused.
pub struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    /// Raw connection for typed sqlx queries inside a unit of work.
    pub fn connection(&mut self) -> Result<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(DbError::HandleClosed)
    }

    fn live(&mut self) -> std::result::Result<&mut PgConnection, EngineError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| EngineError::Connection("transaction already finished".into()))
    }
}

#[async_trait]
impl Session for PgSession {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, EngineError> {
        let conn = self.live()?;
        let done = sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(done.rows_affected())
    }

    async fn query_text(&mut self, sql: &str) -> std::result::Result<Option<String>, EngineError> {
        let conn = self.live()?;
        let value = sqlx::query_scalar::<_, Option<String>>(sql)
            .fetch_one(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn commit(&mut self) -> std::result::Result<(), EngineError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> std::result::Result<(), EngineError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
