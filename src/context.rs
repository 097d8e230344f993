//! Ambient per-call state threaded explicitly through the call graph.

use crate::core::{DbError, Result, TenantId};
use crate::transaction::TxHandle;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Immutable execution context.
///
/// Holds the tenant the caller acts for, the transaction handle of the
/// enclosing scope (if any) and an optional deadline. Every `with_*` method
/// returns a derived value and leaves the receiver untouched, so a nested
/// scope can override fields without affecting its parent.
#[derive(Clone, Default)]
pub struct Context {
    tenant: Option<TenantId>,
    handle: Option<TxHandle>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_tenant(&self, tenant: TenantId) -> Self {
        Self {
            tenant: Some(tenant),
            ..self.clone()
        }
    }

    /// Tenant bound to this context, or `TenantMissing`.
    pub fn tenant(&self) -> Result<TenantId> {
        self.tenant.ok_or(DbError::TenantMissing)
    }

    pub fn with_handle(&self, handle: TxHandle) -> Self {
        Self {
            handle: Some(handle),
            ..self.clone()
        }
    }

    /// Active transaction handle of the enclosing scope.
    pub fn handle(&self) -> Option<&TxHandle> {
        self.handle.as_ref()
    }

    /// Derive a context with the given deadline. An earlier existing
    /// deadline is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `fut` under this context's deadline.
    pub async fn bound<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DbError::DeadlineExceeded)?,
            None => fut.await,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tenant", &self.tenant)
            .field("depth", &self.handle.as_ref().map(|h| h.depth()))
            .field("deadline", &self.deadline)
            .finish()
    }
}
