// ============================================================================
// Transaction Handle
// ============================================================================
//
// A `TxHandle` names one scope on a pooled session: the top-level
// transaction (depth 0) or a savepoint nested inside it. All handles of one
// call stack share the same session slot, so a nested scope and its parent
// never hold the connection at the same time.
//
// Savepoint scopes that are dropped while active cannot run statements from
// `Drop`; their cleanup is queued on the slot and flushed before the next
// statement reaches the session.
//
// ============================================================================

use super::TransactionState;
use crate::context::Context;
use crate::core::{DbError, Result};
use crate::engine::memory::MemorySession;
use crate::engine::postgres::PgSession;
use crate::engine::{ConnectionPool, Session};
use sqlx::postgres::PgConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Prefix of generated savepoint names.
pub const SAVEPOINT_PREFIX: &str = "tenantdb_sp_";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SlotGuard<'a> = tokio::sync::MutexGuard<'a, Option<Box<dyn Session>>>;

struct SessionSlot {
    session: tokio::sync::Mutex<Option<Box<dyn Session>>>,
    /// Statements owed by savepoint scopes dropped while active.
    deferred: Mutex<Vec<String>>,
    savepoints: AtomicU64,
}

struct HandleInner {
    slot: Arc<SessionSlot>,
    depth: usize,
    savepoint: Option<String>,
    state: Mutex<TransactionState>,
}

#[derive(Clone)]
pub struct TxHandle {
    inner: Arc<HandleInner>,
}

impl TxHandle {
    fn new(slot: Arc<SessionSlot>, depth: usize, savepoint: Option<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                slot,
                depth,
                savepoint,
                state: Mutex::new(TransactionState::Active),
            }),
        }
    }

    /// Acquire a connection and open a top-level transaction on it.
    pub async fn begin(pool: &dyn ConnectionPool, cx: &Context) -> Result<Self> {
        let session = cx.bound(async { Ok(pool.begin().await?) }).await?;
        let slot = SessionSlot {
            session: tokio::sync::Mutex::new(Some(session)),
            deferred: Mutex::new(Vec::new()),
            savepoints: AtomicU64::new(0),
        };
        Ok(Self::new(Arc::new(slot), 0, None))
    }

    /// Open a savepoint scope subordinate to this handle.
    ///
    /// Fails with [`DbError::HandleBusy`] instead of waiting while the session
    /// is locked, e.g. by a [`SessionGuard`] the caller still holds.
    pub async fn savepoint(&self, cx: &Context) -> Result<Self> {
        let n = self.inner.slot.savepoints.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{SAVEPOINT_PREFIX}{n}");

        cx.bound(async {
            let mut slot = self.try_lock_live().await?;
            let session = slot.as_deref_mut().ok_or(DbError::HandleClosed)?;
            session.execute(&format!("SAVEPOINT {name}")).await?;
            Ok(())
        })
        .await?;

        Ok(Self::new(
            Arc::clone(&self.inner.slot),
            self.inner.depth + 1,
            Some(name),
        ))
    }

    /// 0 for the top-level transaction, +1 per savepoint level.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn is_nested(&self) -> bool {
        self.inner.savepoint.is_some()
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.inner.savepoint.as_deref()
    }

    pub fn state(&self) -> TransactionState {
        *lock(&self.inner.state)
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut slot = self.lock_live().await?;
        let session = slot.as_deref_mut().ok_or(DbError::HandleClosed)?;
        Ok(session.execute(sql).await?)
    }

    /// Run a statement that yields a single nullable text value.
    pub async fn query_text(&self, sql: &str) -> Result<Option<String>> {
        let mut slot = self.lock_live().await?;
        let session = slot.as_deref_mut().ok_or(DbError::HandleClosed)?;
        Ok(session.query_text(sql).await?)
    }

    /// Exclusive access to the underlying session for typed queries.
    ///
    /// Opening a nested scope while the guard is alive fails with
    /// [`DbError::HandleBusy`].
    pub async fn session(&self) -> Result<SessionGuard<'_>> {
        let slot = self.lock_live().await?;
        Ok(SessionGuard { slot })
    }

    /// Commit the transaction, or release the savepoint.
    ///
    /// A no-op on a handle that already committed; a rolled back handle fails
    /// with [`DbError::HandleClosed`]. On failure the handle stays active so
    /// the caller can still roll it back.
    pub async fn commit(&self, cx: &Context) -> Result<()> {
        match self.state() {
            TransactionState::Active => {}
            TransactionState::Committed => return Ok(()),
            TransactionState::RolledBack => return Err(DbError::HandleClosed),
        }

        match &self.inner.savepoint {
            Some(name) => {
                cx.bound(self.execute(&format!("RELEASE SAVEPOINT {name}")))
                    .await?;
            }
            None => {
                cx.bound(async {
                    let mut slot = self.lock_live().await?;
                    let session = slot.as_deref_mut().ok_or(DbError::HandleClosed)?;
                    session.commit().await?;
                    slot.take();
                    Ok(())
                })
                .await?;
            }
        }

        self.transition(TransactionState::Committed);
        Ok(())
    }

    /// Roll back the transaction, or roll back to and release the savepoint.
    ///
    /// Runs at most once per handle and ignores the context deadline.
    pub async fn rollback(&self) -> Result<()> {
        if !self.transition(TransactionState::RolledBack) {
            return Ok(());
        }

        match &self.inner.savepoint {
            Some(name) => {
                let mut slot = self.inner.slot.session.lock().await;
                let session = slot.as_deref_mut().ok_or(DbError::HandleClosed)?;
                flush_deferred(&self.inner.slot, session).await?;
                session
                    .execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
                    .await?;
                session.execute(&format!("RELEASE SAVEPOINT {name}")).await?;
            }
            None => {
                let session = self.inner.slot.session.lock().await.take();
                if let Some(mut session) = session {
                    session.rollback().await?;
                }
            }
        }

        Ok(())
    }

    /// Synchronous rollback used when a scope is dropped while active.
    fn abandon(&self) {
        if !self.transition(TransactionState::RolledBack) {
            return;
        }

        match &self.inner.savepoint {
            Some(name) => {
                lock(&self.inner.slot.deferred).extend([
                    format!("ROLLBACK TO SAVEPOINT {name}"),
                    format!("RELEASE SAVEPOINT {name}"),
                ]);
            }
            None => {
                // If the slot is busy the session goes away with its last handle.
                if let Ok(mut slot) = self.inner.slot.session.try_lock() {
                    slot.take();
                }
            }
        }

        warn!(
            depth = self.inner.depth,
            savepoint = ?self.inner.savepoint,
            "transaction scope dropped while active, rolled back"
        );
    }

    /// Move from Active to `to`. Returns false if already terminal.
    fn transition(&self, to: TransactionState) -> bool {
        let mut state = lock(&self.inner.state);
        if !state.is_active() {
            return false;
        }
        *state = to;
        true
    }

    async fn lock_live(&self) -> Result<SlotGuard<'_>> {
        self.ensure_active()?;
        let slot = self.inner.slot.session.lock().await;
        self.prepare(slot).await
    }

    async fn try_lock_live(&self) -> Result<SlotGuard<'_>> {
        self.ensure_active()?;
        let slot = self
            .inner
            .slot
            .session
            .try_lock()
            .map_err(|_| DbError::HandleBusy)?;
        self.prepare(slot).await
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state().is_active() {
            Ok(())
        } else {
            Err(DbError::HandleClosed)
        }
    }

    /// Run owed savepoint cleanup before handing the session out.
    async fn prepare<'a>(&'a self, mut slot: SlotGuard<'a>) -> Result<SlotGuard<'a>> {
        let session = slot.as_deref_mut().ok_or(DbError::HandleClosed)?;
        flush_deferred(&self.inner.slot, session).await?;
        Ok(slot)
    }
}

async fn flush_deferred(slot: &SessionSlot, session: &mut dyn Session) -> Result<()> {
    let pending = std::mem::take(&mut *lock(&slot.deferred));
    for sql in pending {
        debug!(statement = %sql, "running deferred savepoint cleanup");
        session.execute(&sql).await?;
    }
    Ok(())
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("depth", &self.inner.depth)
            .field("savepoint", &self.inner.savepoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Locked session of a transaction scope.
pub struct SessionGuard<'a> {
    slot: SlotGuard<'a>,
}

impl SessionGuard<'_> {
    pub fn session(&mut self) -> Result<&mut dyn Session> {
        match self.slot.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(DbError::HandleClosed),
        }
    }

    /// Raw PostgreSQL connection, for `sqlx::query(..).execute(conn)`.
    pub fn postgres(&mut self) -> Result<&mut PgConnection> {
        self.session()?
            .as_any_mut()
            .downcast_mut::<PgSession>()
            .ok_or(DbError::EngineMismatch("postgres"))?
            .connection()
    }

    pub fn memory(&mut self) -> Result<&mut MemorySession> {
        self.session()?
            .as_any_mut()
            .downcast_mut::<MemorySession>()
            .ok_or(DbError::EngineMismatch("memory"))
    }
}

/// Exit safeguard for a transaction scope.
///
/// Dropping the guard while its handle is still active (an early return, a
/// panic, or the enclosing future being cancelled) rolls the scope back.
/// After a commit or rollback it does nothing.
pub struct TxGuard {
    handle: TxHandle,
}

impl TxGuard {
    pub fn new(handle: TxHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &TxHandle {
        &self.handle
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        self.handle.abandon();
    }
}
