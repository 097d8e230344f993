// ============================================================================
// tenantdb
// ============================================================================
//
// Tenant-isolated transactions for PostgreSQL row-level security.
//
// Every unit of work runs through `TenantTransactionManager`, which binds the
// tenant from the `Context` to a transaction-local session variable before
// the work sees the connection. Nested calls become savepoints, and the
// parent's binding is restored when a nested scope commits.
//
// ```ignore
// let manager = TenantTransactionManager::new(pool, ScopeConfig::default())?;
// let cx = Context::background().with_tenant(tenant);
//
// let name = query(&manager, &cx, |_cx, tx| async move {
//     let mut session = tx.session().await?;
//     let row: (String,) = sqlx::query_as("SELECT name FROM app.products LIMIT 1")
//         .fetch_one(session.postgres()?)
//         .await?;
//     Ok(row.0)
// })
// .await?;
// ```
//
// ============================================================================

pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod logging;
pub mod policy;
pub mod quote;
pub mod transaction;
pub mod translate;

pub use config::{AppConfig, ConnectionDefaults, Credentials, DatabaseConfig, PoolConfig, ScopeConfig};
pub use context::Context;
pub use core::{DbError, DomainError, EngineError, ErrorCode, Result, TenantId};
pub use engine::memory::{Fault, MemoryPool, MemoryRow, MemorySession, MemoryStats};
pub use engine::postgres::{PgConnectionPool, PgSession};
pub use engine::{ConnectionPool, Session};
pub use logging::init_tracing;
pub use policy::{TenantPolicy, drop_app_user, grant_app_user};
pub use quote::{quote_identifier, quote_literal};
pub use transaction::{
    PriorSetting, SessionGuard, TenantTransactionManager, TransactionState, TxGuard, TxHandle,
    exec, query,
};
pub use translate::{translate, translate_result};
