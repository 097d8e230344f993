// ============================================================================
// In-Memory Engine
// ============================================================================
//
// Emulates the slice of PostgreSQL behaviour the transaction manager relies
// on, so scoping can be exercised without a server:
//
// - transaction-local settings (`SET LOCAL`) and `current_setting(name, ok)`
// - placeholder settings that stay defined (as '') on the connection
// - savepoint stack; RELEASE keeps settings, ROLLBACK TO restores them
// - aborted-transaction state after a failed statement
// - per-table row policy bound to a setting (USING + WITH CHECK), cast to
//   uuid: NULL hides every row, a non-uuid value fails with 22P02
// - unique key per table (SQLSTATE 23505)
//
// Reads are read-committed: committed rows overlaid with the session's own
// pending writes.
//
// ============================================================================

use super::{ConnectionPool, Session};
use crate::core::{EngineError, TenantId};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

lazy_static! {
    static ref SAVEPOINT_RE: Regex =
        Regex::new(r"(?i)^\s*SAVEPOINT\s+([A-Za-z_][A-Za-z0-9_]*)\s*;?\s*$").unwrap();
    static ref RELEASE_RE: Regex =
        Regex::new(r"(?i)^\s*RELEASE\s+(?:SAVEPOINT\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*;?\s*$")
            .unwrap();
    static ref ROLLBACK_TO_RE: Regex = Regex::new(
        r"(?i)^\s*ROLLBACK\s+TO\s+(?:SAVEPOINT\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*;?\s*$"
    )
    .unwrap();
    static ref SET_LOCAL_RE: Regex =
        Regex::new(r"(?is)^\s*SET\s+LOCAL\s+(.+?)\s*=\s*(.+?)\s*;?\s*$").unwrap();
    static ref CURRENT_SETTING_RE: Regex = Regex::new(
        r"(?is)^\s*SELECT\s+current_setting\s*\(\s*(.+?)\s*(?:,\s*(true|false)\s*)?\)\s*;?\s*$"
    )
    .unwrap();
}

const SYNTAX_ERROR: &str = "42601";
const UNDEFINED_OBJECT: &str = "42704";
const INSUFFICIENT_PRIVILEGE: &str = "42501";
const INVALID_TEXT_REPRESENTATION: &str = "22P02";
const UNIQUE_VIOLATION: &str = "23505";
const IN_FAILED_TRANSACTION: &str = "25P02";
const INVALID_SAVEPOINT: &str = "3B001";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A row stored in a memory table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRow {
    pub key: String,
    pub tenant: TenantId,
    pub payload: Value,
}

/// Where an injected failure fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Begin,
    Commit,
    Rollback,
    /// Any statement starting with this text (case-insensitive).
    Statement(String),
}

impl Fault {
    fn matches_statement(&self, sql: &str) -> bool {
        match self {
            Fault::Statement(prefix) => sql
                .trim_start()
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
            _ => false,
        }
    }
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub acquisitions: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Sessions dropped without commit or rollback.
    pub abandoned: usize,
    pub total_connections: usize,
    pub available_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Memory Pool: {}/{} connections available, max {}, {} acquisitions, {} commits, {} rollbacks, {} abandoned",
            self.available_connections,
            self.total_connections,
            self.max_connections,
            self.acquisitions,
            self.commits,
            self.rollbacks,
            self.abandoned
        )
    }
}

/// Physical connection: what survives between transactions.
struct MemoryConnection {
    id: u64,
    /// Placeholder settings defined on this connection.
    defined: HashSet<String>,
}

struct Shared {
    tables: Mutex<HashMap<String, Vec<MemoryRow>>>,
    /// table -> setting that carries the tenant
    policies: Mutex<HashMap<String, String>>,
    available: Mutex<VecDeque<MemoryConnection>>,
    faults: Mutex<Vec<Fault>>,
    max_connections: AtomicUsize,
    acquire_timeout: Mutex<Duration>,
    total_connections: AtomicUsize,
    next_id: AtomicU64,
    acquisitions: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    abandoned: AtomicUsize,
}

impl Shared {
    fn take_fault(&self, predicate: impl Fn(&Fault) -> bool) -> bool {
        let mut faults = lock(&self.faults);
        match faults.iter().position(predicate) {
            Some(index) => {
                faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn try_acquire(&self) -> Option<MemoryConnection> {
        if let Some(conn) = lock(&self.available).pop_front() {
            return Some(conn);
        }

        let max = self.max_connections.load(Ordering::SeqCst);
        let created = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok();

        created.then(|| MemoryConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            defined: HashSet::new(),
        })
    }

    fn release(&self, conn: MemoryConnection) {
        lock(&self.available).push_back(conn);
    }
}

/// Connection pool over a shared in-process database.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<Shared>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(HashMap::new()),
                policies: Mutex::new(HashMap::new()),
                available: Mutex::new(VecDeque::new()),
                faults: Mutex::new(Vec::new()),
                max_connections: AtomicUsize::new(10),
                acquire_timeout: Mutex::new(Duration::from_secs(1)),
                total_connections: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                acquisitions: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                abandoned: AtomicUsize::new(0),
            }),
        }
    }

    /// Set maximum connections
    pub fn max_connections(self, max: usize) -> Self {
        self.shared.max_connections.store(max, Ordering::SeqCst);
        self
    }

    /// Set how long `begin` waits for a free connection
    pub fn acquire_timeout(self, timeout: Duration) -> Self {
        *lock(&self.shared.acquire_timeout) = timeout;
        self
    }

    /// Enable a tenant row policy on `table`, keyed by the setting `variable`
    /// (`schema.field`).
    pub fn with_policy(self, table: &str, variable: &str) -> Self {
        lock(&self.shared.policies).insert(table.to_string(), variable.to_string());
        self
    }

    /// Make the next operation matching `fault` fail. One-shot.
    pub fn inject(&self, fault: Fault) {
        lock(&self.shared.faults).push(fault);
    }

    /// Committed rows of a table, bypassing policies.
    pub fn committed_rows(&self, table: &str) -> Vec<MemoryRow> {
        lock(&self.shared.tables)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        let total = self.shared.total_connections.load(Ordering::SeqCst);
        MemoryStats {
            acquisitions: self.shared.acquisitions.load(Ordering::SeqCst),
            commits: self.shared.commits.load(Ordering::SeqCst),
            rollbacks: self.shared.rollbacks.load(Ordering::SeqCst),
            abandoned: self.shared.abandoned.load(Ordering::SeqCst),
            total_connections: total,
            available_connections: lock(&self.shared.available).len(),
            max_connections: self.shared.max_connections.load(Ordering::SeqCst),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn begin(&self) -> Result<Box<dyn Session>, EngineError> {
        self.shared.acquisitions.fetch_add(1, Ordering::SeqCst);

        if self.shared.take_fault(|f| *f == Fault::Begin) {
            return Err(EngineError::Connection("injected begin failure".into()));
        }

        let timeout = *lock(&self.shared.acquire_timeout);
        let start = Instant::now();

        loop {
            if let Some(conn) = self.shared.try_acquire() {
                return Ok(Box::new(MemorySession::new(Arc::clone(&self.shared), conn)));
            }

            if start.elapsed() > timeout {
                return Err(EngineError::PoolTimedOut);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Insert { table: String, row: MemoryRow },
    Update { table: String, key: String, payload: Value },
    Delete { table: String, key: String },
}

impl WriteOp {
    fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }
}

struct SavepointFrame {
    name: String,
    ops_len: usize,
    settings: HashMap<String, String>,
}

/// An open transaction on a memory connection.
pub struct MemorySession {
    shared: Arc<Shared>,
    conn: Option<MemoryConnection>,
    ops: Vec<WriteOp>,
    settings: HashMap<String, String>,
    touched: HashSet<String>,
    savepoints: Vec<SavepointFrame>,
    aborted: bool,
}

impl MemorySession {
    fn new(shared: Arc<Shared>, conn: MemoryConnection) -> Self {
        Self {
            shared,
            conn: Some(conn),
            ops: Vec::new(),
            settings: HashMap::new(),
            touched: HashSet::new(),
            savepoints: Vec::new(),
            aborted: false,
        }
    }

    /// Id of the physical connection this transaction runs on.
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id)
    }

    /// Value of a setting as `current_setting(name, true)` would return it.
    pub fn current_setting(&self, name: &str) -> Option<String> {
        if let Some(value) = self.settings.get(name) {
            return Some(value.clone());
        }
        let defined = self.touched.contains(name)
            || self
                .conn
                .as_ref()
                .is_some_and(|conn| conn.defined.contains(name));
        defined.then(String::new)
    }

    pub fn insert(
        &mut self,
        table: &str,
        key: &str,
        tenant: TenantId,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.ensure_usable()?;

        if let Some(variable) = self.policy_variable(table) {
            match self.policy_tenant(&variable) {
                Ok(Some(current)) if current == tenant.as_uuid() => {}
                Ok(_) => {
                    return self.fail(EngineError::database(
                        INSUFFICIENT_PRIVILEGE,
                        format!(
                            "new row violates row-level security policy for table \"{table}\""
                        ),
                    ));
                }
                Err(err) => return self.fail(err),
            }
        }

        if self.all_rows(table).iter().any(|row| row.key == key) {
            return self.fail(duplicate_key(table, key));
        }

        self.ops.push(WriteOp::Insert {
            table: table.to_string(),
            row: MemoryRow {
                key: key.to_string(),
                tenant,
                payload,
            },
        });
        Ok(())
    }

    pub fn update(&mut self, table: &str, key: &str, payload: Value) -> Result<u64, EngineError> {
        self.ensure_usable()?;
        if !self.visible_rows(table)?.iter().any(|row| row.key == key) {
            return Ok(0);
        }
        self.ops.push(WriteOp::Update {
            table: table.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(1)
    }

    pub fn delete(&mut self, table: &str, key: &str) -> Result<u64, EngineError> {
        self.ensure_usable()?;
        if !self.visible_rows(table)?.iter().any(|row| row.key == key) {
            return Ok(0);
        }
        self.ops.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
        Ok(1)
    }

    pub fn get(&mut self, table: &str, key: &str) -> Result<MemoryRow, EngineError> {
        self.ensure_usable()?;
        self.visible_rows(table)?
            .into_iter()
            .find(|row| row.key == key)
            .ok_or(EngineError::RowNotFound)
    }

    pub fn select(&mut self, table: &str) -> Result<Vec<MemoryRow>, EngineError> {
        self.ensure_usable()?;
        self.visible_rows(table)
    }

    fn ensure_usable(&self) -> Result<(), EngineError> {
        if self.conn.is_none() {
            return Err(EngineError::Connection("transaction already finished".into()));
        }
        if self.aborted {
            return Err(EngineError::database(
                IN_FAILED_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: EngineError) -> Result<T, EngineError> {
        self.aborted = true;
        Err(err)
    }

    fn policy_variable(&self, table: &str) -> Option<String> {
        lock(&self.shared.policies).get(table).cloned()
    }

    /// `current_setting(variable, true)::uuid`
    fn policy_tenant(&self, variable: &str) -> Result<Option<Uuid>, EngineError> {
        match self.current_setting(variable) {
            None => Ok(None),
            Some(value) => Uuid::parse_str(&value).map(Some).map_err(|_| {
                EngineError::database(
                    INVALID_TEXT_REPRESENTATION,
                    format!("invalid input syntax for type uuid: \"{value}\""),
                )
            }),
        }
    }

    /// Committed rows overlaid with this session's pending writes.
    fn all_rows(&self, table: &str) -> Vec<MemoryRow> {
        let mut rows = lock(&self.shared.tables)
            .get(table)
            .cloned()
            .unwrap_or_default();
        for op in &self.ops {
            apply_op(&mut rows, table, op);
        }
        rows
    }

    fn visible_rows(&mut self, table: &str) -> Result<Vec<MemoryRow>, EngineError> {
        let rows = self.all_rows(table);
        let Some(variable) = self.policy_variable(table) else {
            return Ok(rows);
        };
        match self.policy_tenant(&variable) {
            Ok(Some(tenant)) => Ok(rows
                .into_iter()
                .filter(|row| row.tenant.as_uuid() == tenant)
                .collect()),
            Ok(None) => Ok(Vec::new()),
            Err(err) => self.fail(err),
        }
    }

    fn savepoint_index(&self, name: &str) -> Result<usize, EngineError> {
        self.savepoints
            .iter()
            .rposition(|frame| frame.name == name)
            .ok_or_else(|| {
                EngineError::database(
                    INVALID_SAVEPOINT,
                    format!("savepoint \"{name}\" does not exist"),
                )
            })
    }

    fn run_statement(&mut self, sql: &str) -> Result<Option<Option<String>>, EngineError> {
        if let Some(caps) = ROLLBACK_TO_RE.captures(sql) {
            if self.conn.is_none() {
                return Err(EngineError::Connection("transaction already finished".into()));
            }
            let index = match self.savepoint_index(&caps[1]) {
                Ok(index) => index,
                Err(err) => return self.fail(err),
            };
            self.savepoints.truncate(index + 1);
            let frame = &self.savepoints[index];
            self.ops.truncate(frame.ops_len);
            self.settings = frame.settings.clone();
            self.aborted = false;
            return Ok(None);
        }

        self.ensure_usable()?;

        if self
            .shared
            .take_fault(|fault| fault.matches_statement(sql))
        {
            return self.fail(EngineError::database(
                "XX000",
                format!("injected failure for statement: {}", sql.trim()),
            ));
        }

        if let Some(caps) = SAVEPOINT_RE.captures(sql) {
            self.savepoints.push(SavepointFrame {
                name: caps[1].to_string(),
                ops_len: self.ops.len(),
                settings: self.settings.clone(),
            });
            return Ok(None);
        }

        if let Some(caps) = RELEASE_RE.captures(sql) {
            let index = match self.savepoint_index(&caps[1]) {
                Ok(index) => index,
                Err(err) => return self.fail(err),
            };
            // Writes and settings made since the savepoint stay in effect.
            self.savepoints.truncate(index);
            return Ok(None);
        }

        if let Some(caps) = SET_LOCAL_RE.captures(sql) {
            let parsed = parse_identifier(&caps[1]).and_then(|name| {
                let value = parse_literal(&caps[2])?;
                Ok((name, value))
            });
            let (name, value) = match parsed {
                Ok(pair) => pair,
                Err(err) => return self.fail(err),
            };
            self.touched.insert(name.clone());
            self.settings.insert(name, value);
            return Ok(None);
        }

        if let Some(caps) = CURRENT_SETTING_RE.captures(sql) {
            let name = match parse_literal(&caps[1]) {
                Ok(name) => name,
                Err(err) => return self.fail(err),
            };
            let missing_ok = caps
                .get(2)
                .is_some_and(|flag| flag.as_str().eq_ignore_ascii_case("true"));
            return match self.current_setting(&name) {
                Some(value) => Ok(Some(Some(value))),
                None if missing_ok => Ok(Some(None)),
                None => self.fail(EngineError::database(
                    UNDEFINED_OBJECT,
                    format!("unrecognized configuration parameter \"{name}\""),
                )),
            };
        }

        self.fail(syntax_error(sql))
    }

    fn finish(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.defined.extend(self.touched.drain());
            self.shared.release(conn);
        }
        self.ops.clear();
        self.settings.clear();
        self.savepoints.clear();
        self.aborted = false;
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, sql: &str) -> Result<u64, EngineError> {
        self.run_statement(sql)?;
        Ok(0)
    }

    async fn query_text(&mut self, sql: &str) -> Result<Option<String>, EngineError> {
        match self.run_statement(sql)? {
            Some(value) => Ok(value),
            None => Err(EngineError::RowNotFound),
        }
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        if self.conn.is_none() {
            return Ok(());
        }
        if self.shared.take_fault(|f| *f == Fault::Commit) {
            return Err(EngineError::Connection("injected commit failure".into()));
        }
        if self.aborted {
            self.finish();
            return Err(EngineError::database(
                IN_FAILED_TRANSACTION,
                "current transaction is aborted, commit rolled back",
            ));
        }

        // Apply onto a working copy so a key committed concurrently by
        // another session fails the whole commit.
        let conflict = {
            let mut tables = lock(&self.shared.tables);
            let mut working = tables.clone();
            let mut conflict = None;
            for op in &self.ops {
                let table = op.table();
                let rows = working.entry(table.to_string()).or_default();
                if let WriteOp::Insert { row, .. } = op {
                    if rows.iter().any(|r| r.key == row.key) {
                        conflict = Some(duplicate_key(table, &row.key));
                        break;
                    }
                }
                apply_op(rows, table, op);
            }
            if conflict.is_none() {
                *tables = working;
            }
            conflict
        };

        if let Some(err) = conflict {
            self.finish();
            return Err(err);
        }

        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        if self.conn.is_none() {
            return Ok(());
        }
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.shared.take_fault(|f| *f == Fault::Rollback) {
            return Err(EngineError::Connection("injected rollback failure".into()));
        }
        self.finish();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.shared.abandoned.fetch_add(1, Ordering::SeqCst);
            self.finish();
        }
    }
}

fn apply_op(rows: &mut Vec<MemoryRow>, table: &str, op: &WriteOp) {
    match op {
        WriteOp::Insert { table: t, row } if t == table => rows.push(row.clone()),
        WriteOp::Update {
            table: t,
            key,
            payload,
        } if t == table => {
            if let Some(row) = rows.iter_mut().find(|row| &row.key == key) {
                row.payload = payload.clone();
            }
        }
        WriteOp::Delete { table: t, key } if t == table => rows.retain(|row| &row.key != key),
        _ => {}
    }
}

fn duplicate_key(table: &str, key: &str) -> EngineError {
    EngineError::database(
        UNIQUE_VIOLATION,
        format!("duplicate key value violates unique constraint \"{table}_pkey\" (key = {key})"),
    )
}

fn syntax_error(sql: &str) -> EngineError {
    let near = sql.split_whitespace().next().unwrap_or_default();
    EngineError::database(SYNTAX_ERROR, format!("syntax error at or near \"{near}\""))
}

/// Parse a possibly quoted, possibly dotted setting name into `a.b` form.
fn parse_identifier(text: &str) -> Result<String, EngineError> {
    let mut parts = Vec::new();
    let mut chars = text.trim().chars().peekable();

    loop {
        let mut part = String::new();
        match chars.peek() {
            Some('"') => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            part.push('"');
                        }
                        Some('"') => break,
                        Some(c) => part.push(c),
                        None => return Err(syntax_error(text)),
                    }
                }
            }
            Some(_) => {
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        part.push(c.to_ascii_lowercase());
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            None => return Err(syntax_error(text)),
        }

        if part.is_empty() {
            return Err(syntax_error(text));
        }
        parts.push(part);

        match chars.next() {
            Some('.') => continue,
            None => break,
            Some(_) => return Err(syntax_error(text)),
        }
    }

    Ok(parts.join("."))
}

/// Parse a string literal in standard (`'..'`) or escape (`E'..'`) form.
fn parse_literal(text: &str) -> Result<String, EngineError> {
    let text = text.trim();
    let (escape, body) = match text.strip_prefix(['E', 'e']) {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let inner = body
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .ok_or_else(|| syntax_error(text))?;

    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                value.push('\'');
            }
            '\'' => return Err(syntax_error(text)),
            '\\' if escape => match chars.next() {
                Some(next) => value.push(next),
                None => return Err(syntax_error(text)),
            },
            c => value.push(c),
        }
    }
    Ok(value)
}
