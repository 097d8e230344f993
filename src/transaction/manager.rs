// ============================================================================
// Tenant Transaction Manager
// ============================================================================
//
// Runs a unit of work inside a transaction whose row-level security setting
// is bound to the context's tenant.
//
// Nesting is emulated with savepoints. PostgreSQL keeps a `SET LOCAL` made
// inside a savepoint after the savepoint is released, so once a nested scope
// commits, the setting the parent held before is re-applied on the parent.
// If that fails the parent is rolled back; it never runs as the child.
//
// ============================================================================

use super::{TxGuard, TxHandle};
use crate::config::ScopeConfig;
use crate::context::Context;
use crate::core::Result;
use crate::engine::ConnectionPool;
use crate::quote::{quote_identifier, quote_literal};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Value of the security setting observed before a nested scope changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorSetting {
    /// The setting was never defined on the connection.
    Unset,
    /// Defined, but empty.
    Empty,
    Value(String),
}

impl PriorSetting {
    fn from_raw(raw: Option<String>) -> Self {
        match raw {
            None => PriorSetting::Unset,
            Some(value) if value.is_empty() => PriorSetting::Empty,
            Some(value) => PriorSetting::Value(value),
        }
    }

    /// Value to put back on the parent scope.
    ///
    /// A placeholder cannot be undefined again inside a transaction, so
    /// `Unset` is restored as the empty string. Policies cast the setting to
    /// `uuid`, and `''::uuid` is an error, so tenant tables fail closed.
    pub fn restore_value(&self) -> &str {
        match self {
            PriorSetting::Value(value) => value,
            PriorSetting::Empty | PriorSetting::Unset => "",
        }
    }
}

pub struct TenantTransactionManager {
    pool: Arc<dyn ConnectionPool>,
    scope: ScopeConfig,
    /// Quoted `"schema"."field"` target for SET LOCAL.
    target: String,
    read_statement: String,
}

impl TenantTransactionManager {
    pub fn new(pool: Arc<dyn ConnectionPool>, scope: ScopeConfig) -> Result<Self> {
        scope.validate()?;

        let target = quote_identifier(&[scope.schema.as_str(), scope.field.as_str()]);
        let read_statement = format!(
            "SELECT current_setting({}, true)",
            quote_literal(&scope.variable_name())
        );

        Ok(Self {
            pool,
            scope,
            target,
            read_statement,
        })
    }

    pub fn scope(&self) -> &ScopeConfig {
        &self.scope
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Run `work` in a transaction scoped to the context's tenant.
    ///
    /// Opens a top-level transaction, or a savepoint when `cx` already carries
    /// a handle. `work` receives a derived context carrying the new handle.
    /// Its error is returned unchanged after the scope is rolled back; on
    /// success the scope is committed. Engine errors are not translated here.
    pub async fn run_in_transaction<T, F, Fut>(&self, cx: &Context, work: F) -> Result<T>
    where
        F: FnOnce(Context, TxHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tenant = cx.tenant()?;
        let parent = cx.handle().cloned();

        let handle = match &parent {
            Some(parent) => parent.savepoint(cx).await?,
            None => TxHandle::begin(self.pool.as_ref(), cx).await?,
        };
        let _guard = TxGuard::new(handle.clone());

        debug!(
            tenant = %tenant,
            depth = handle.depth(),
            variable = %self.scope.variable_name(),
            "entering tenant scope"
        );

        let prior = match &parent {
            Some(_) => self.read_prior(cx, &handle).await,
            None => None,
        };

        if let Err(err) = cx.bound(handle.execute(&self.set_statement(&tenant.to_string()))).await {
            self.rollback_logged(&handle).await;
            return Err(err);
        }

        let scoped = cx.with_tenant(tenant).with_handle(handle.clone());
        let value = match cx.bound(work(scoped, handle.clone())).await {
            Ok(value) => value,
            Err(err) => {
                debug!(tenant = %tenant, depth = handle.depth(), error = %err, "unit of work failed");
                self.rollback_logged(&handle).await;
                return Err(err);
            }
        };

        if let Err(err) = handle.commit(cx).await {
            warn!(tenant = %tenant, depth = handle.depth(), error = %err, "commit failed");
            self.rollback_logged(&handle).await;
            return Err(err);
        }

        // Not deadline-bound: the savepoint is released, so until this runs
        // the parent is bound to this scope's tenant.
        if let (Some(parent), Some(prior)) = (&parent, prior) {
            if let Err(err) = parent
                .execute(&self.set_statement(prior.restore_value()))
                .await
            {
                warn!(
                    tenant = %tenant,
                    depth = parent.depth(),
                    error = %err,
                    "could not restore parent tenant setting, rolling back parent"
                );
                self.rollback_logged(parent).await;
                return Err(err);
            }
        }

        debug!(tenant = %tenant, depth = handle.depth(), "leaving tenant scope");
        Ok(value)
    }

    /// `SET LOCAL "schema"."field" = '<value>'`
    fn set_statement(&self, value: &str) -> String {
        format!("SET LOCAL {} = {}", self.target, quote_literal(value))
    }

    /// Best effort; `None` means nothing will be restored.
    async fn read_prior(&self, cx: &Context, handle: &TxHandle) -> Option<PriorSetting> {
        match cx.bound(handle.query_text(&self.read_statement)).await {
            Ok(raw) => Some(PriorSetting::from_raw(raw)),
            Err(err) => {
                warn!(
                    depth = handle.depth(),
                    variable = %self.scope.variable_name(),
                    error = %err,
                    "could not read prior tenant setting"
                );
                None
            }
        }
    }

    async fn rollback_logged(&self, handle: &TxHandle) {
        if let Err(err) = handle.rollback().await {
            warn!(depth = handle.depth(), error = %err, "rollback failed");
        }
    }
}

impl std::fmt::Debug for TenantTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantTransactionManager")
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_setting_from_raw() {
        assert_eq!(PriorSetting::from_raw(None), PriorSetting::Unset);
        assert_eq!(PriorSetting::from_raw(Some(String::new())), PriorSetting::Empty);
        assert_eq!(
            PriorSetting::from_raw(Some("abc".into())),
            PriorSetting::Value("abc".into())
        );
    }

    #[test]
    fn test_restore_value() {
        assert_eq!(PriorSetting::Unset.restore_value(), "");
        assert_eq!(PriorSetting::Empty.restore_value(), "");
        assert_eq!(PriorSetting::Value("t1".into()).restore_value(), "t1");
    }

    #[test]
    fn test_rendered_statements() {
        let pool: Arc<dyn ConnectionPool> = Arc::new(crate::engine::memory::MemoryPool::new());
        let manager = TenantTransactionManager::new(pool, ScopeConfig::default()).unwrap();

        assert_eq!(
            manager.set_statement("it's"),
            r#"SET LOCAL "app"."current_organization" = 'it''s'"#
        );
        assert_eq!(
            manager.read_statement,
            "SELECT current_setting('app.current_organization', true)"
        );
    }

    #[test]
    fn test_invalid_scope_rejected() {
        let pool: Arc<dyn ConnectionPool> = Arc::new(crate::engine::memory::MemoryPool::new());
        let scope = ScopeConfig::new("", "current_organization");
        assert!(TenantTransactionManager::new(pool, scope).is_err());
    }
}
