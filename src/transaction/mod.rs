// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Tenant-scoped transactions over a pooled storage engine.
//
// - `TxHandle`: one transaction or savepoint scope on a shared session
// - `TxGuard`: rolls a scope back when it is dropped while active
// - `TenantTransactionManager`: opens scopes and binds the tenant setting
// - `query` / `exec`: manager + error translation for application code
//
// ============================================================================

pub mod handle;
pub mod helpers;
pub mod manager;
pub mod state;

pub use handle::{SessionGuard, TxGuard, TxHandle, SAVEPOINT_PREFIX};
pub use helpers::{exec, query};
pub use manager::{PriorSetting, TenantTransactionManager};
pub use state::TransactionState;
