//! Entry points for application code: run a unit of work through the
//! manager and translate the terminal error.

use super::{TenantTransactionManager, TxHandle};
use crate::context::Context;
use crate::core::Result;
use crate::translate::translate;
use std::future::Future;

/// Run `work` in a tenant-scoped transaction and return its value.
///
/// "No rows" becomes `NOT_FOUND` and a unique violation becomes `CONFLICT`;
/// every other error is returned as is.
pub async fn query<T, F, Fut>(manager: &TenantTransactionManager, cx: &Context, work: F) -> Result<T>
where
    F: FnOnce(Context, TxHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    manager.run_in_transaction(cx, work).await.map_err(translate)
}

/// Like [`query`], discarding the success value.
pub async fn exec<T, F, Fut>(manager: &TenantTransactionManager, cx: &Context, work: F) -> Result<()>
where
    F: FnOnce(Context, TxHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    query(manager, cx, work).await.map(|_| ())
}
