//! Recording connections for testing code that runs inside scopes.
//!
//! [`RecordingSource`] hands out [`RecordingConnection`]s that keep their
//! statements in memory, emulate transactions and savepoints, log every call
//! as an [`Event`] and can be told to fail on chosen operations.

use crate::{Connection, ConnectionSource, JdbcError, JdbcResult, Row, Savepoint, Value};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// An operation of a recording connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `get_connection()` on the source.
    Acquire,
    /// `execute()`.
    Execute,
    /// `set_auto_commit()`.
    SetAutoCommit,
    /// `commit()`.
    Commit,
    /// `rollback()`.
    Rollback,
    /// `rollback_to()`.
    RollbackTo,
    /// `set_savepoint()` and `set_named_savepoint()`.
    SetSavepoint,
    /// `release_savepoint()`.
    ReleaseSavepoint,
    /// `close()`.
    Close,
}

/// A call made on a recording connection.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection was acquired.
    Acquire { connection: u64 },
    /// A statement was executed.
    Execute { connection: u64, sql: String },
    /// Auto-commit mode was changed.
    SetAutoCommit { connection: u64, auto_commit: bool },
    /// The transaction was committed.
    Commit { connection: u64 },
    /// The whole transaction was rolled back.
    Rollback { connection: u64 },
    /// The transaction was rolled back to a savepoint.
    RollbackTo { connection: u64, savepoint: String },
    /// A savepoint was set.
    SetSavepoint { connection: u64, savepoint: String },
    /// A savepoint was released.
    ReleaseSavepoint { connection: u64, savepoint: String },
    /// The connection was closed.
    Close { connection: u64 },
}

impl Event {
    /// Id of the connection the event happened on.
    pub fn connection(&self) -> u64 {
        match self {
            Event::Acquire { connection }
            | Event::Execute { connection, .. }
            | Event::SetAutoCommit { connection, .. }
            | Event::Commit { connection }
            | Event::Rollback { connection }
            | Event::RollbackTo { connection, .. }
            | Event::SetSavepoint { connection, .. }
            | Event::ReleaseSavepoint { connection, .. }
            | Event::Close { connection } => *connection,
        }
    }

    /// A connection was acquired.
    pub fn is_acquire(&self) -> bool {
        matches!(self, Event::Acquire { .. })
    }

    /// A physical commit.
    pub fn is_commit(&self) -> bool {
        matches!(self, Event::Commit { .. })
    }

    /// A rollback of the whole transaction.
    pub fn is_full_rollback(&self) -> bool {
        matches!(self, Event::Rollback { .. })
    }

    /// A rollback to a savepoint.
    pub fn is_rollback_to(&self) -> bool {
        matches!(self, Event::RollbackTo { .. })
    }

    /// A savepoint was set.
    pub fn is_savepoint(&self) -> bool {
        matches!(self, Event::SetSavepoint { .. })
    }

    /// A physical close.
    pub fn is_close(&self) -> bool {
        matches!(self, Event::Close { .. })
    }
}

#[derive(Debug, Default)]
struct Store {
    next_connection: u64,
    committed: Vec<String>,
    events: Vec<Event>,
    failing: HashSet<Operation>,
    failing_statements: Vec<String>,
}

impl Store {
    fn check(&self, op: Operation) -> JdbcResult<()> {
        if self.failing.contains(&op) {
            return Err(JdbcError::Database(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

/// A connection source backed by an in-memory statement log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSource {
    store: Arc<Mutex<Store>>,
}

impl RecordingSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements committed so far, in commit order.
    pub fn committed(&self) -> Vec<String> {
        self.store.lock().committed.clone()
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.store.lock().events.clone()
    }

    /// Number of events matching `filter`.
    pub fn count(&self, filter: impl Fn(&Event) -> bool) -> usize {
        self.store.lock().events.iter().filter(|e| filter(e)).count()
    }

    /// Number of connections acquired and not closed yet.
    pub fn open_connections(&self) -> usize {
        let store = self.store.lock();
        let acquired = store.events.iter().filter(|e| e.is_acquire()).count();
        let closed = store.events.iter().filter(|e| e.is_close()).count();
        acquired.saturating_sub(closed)
    }

    /// Make every call of `op` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, op: Operation) {
        self.store.lock().failing.insert(op);
    }

    /// Make statements containing `pattern` fail.
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.store.lock().failing_statements.push(pattern.into());
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        let mut store = self.store.lock();
        store.failing.clear();
        store.failing_statements.clear();
    }
}

impl ConnectionSource for RecordingSource {
    fn get_connection(&self) -> JdbcResult<Box<dyn Connection>> {
        let mut store = self.store.lock();
        store.check(Operation::Acquire)?;
        store.next_connection += 1;
        let id = store.next_connection;
        store.events.push(Event::Acquire { connection: id });
        Ok(Box::new(RecordingConnection {
            id,
            store: self.store.clone(),
            auto_commit: true,
            pending: Vec::new(),
            savepoints: Vec::new(),
            next_savepoint: 0,
            closed: false,
        }))
    }
}

/// A connection of a [`RecordingSource`].
///
/// Statements executed in manual-commit mode stay pending until committed;
/// `query` returns one row per visible statement.
#[derive(Debug)]
pub struct RecordingConnection {
    id: u64,
    store: Arc<Mutex<Store>>,
    auto_commit: bool,
    pending: Vec<String>,
    savepoints: Vec<(Savepoint, usize)>,
    next_savepoint: u64,
    closed: bool,
}

impl RecordingConnection {
    /// Id of this connection, as found in [`Event`]s.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> JdbcResult<()> {
        if self.closed {
            return Err(JdbcError::Closed);
        }
        Ok(())
    }

    fn record(&self, op: Operation, event: Event) -> JdbcResult<()> {
        self.ensure_open()?;
        let mut store = self.store.lock();
        store.check(op)?;
        store.events.push(event);
        Ok(())
    }

    fn commit_pending(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        self.store.lock().committed.append(&mut pending);
        self.savepoints.clear();
    }

    fn find_savepoint(&self, savepoint: &Savepoint) -> JdbcResult<usize> {
        self.savepoints
            .iter()
            .position(|(sp, _)| sp == savepoint)
            .ok_or_else(|| {
                JdbcError::Savepoint(format!("unknown savepoint {}", savepoint.identifier()))
            })
    }

    fn push_savepoint(&mut self, savepoint: Savepoint) -> JdbcResult<Savepoint> {
        self.record(
            Operation::SetSavepoint,
            Event::SetSavepoint {
                connection: self.id,
                savepoint: savepoint.identifier().into_owned(),
            },
        )?;
        self.savepoints.push((savepoint.clone(), self.pending.len()));
        Ok(savepoint)
    }
}

impl Connection for RecordingConnection {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> JdbcResult<usize> {
        self.ensure_open()?;
        {
            let mut store = self.store.lock();
            store.check(Operation::Execute)?;
            if store.failing_statements.iter().any(|p| sql.contains(p.as_str())) {
                return Err(JdbcError::Database(format!("statement failed: {}", sql)));
            }
            store.events.push(Event::Execute {
                connection: self.id,
                sql: sql.to_string(),
            });
            if self.auto_commit {
                store.committed.push(sql.to_string());
                return Ok(1);
            }
        }
        self.pending.push(sql.to_string());
        Ok(1)
    }

    fn query(&mut self, _sql: &str, _params: &[Value]) -> JdbcResult<Vec<Row>> {
        self.ensure_open()?;
        let store = self.store.lock();
        Ok(store
            .committed
            .iter()
            .chain(self.pending.iter())
            .map(|sql| vec![Value::Text(sql.clone())])
            .collect())
    }

    fn auto_commit(&self) -> JdbcResult<bool> {
        self.ensure_open()?;
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> JdbcResult<()> {
        self.record(
            Operation::SetAutoCommit,
            Event::SetAutoCommit {
                connection: self.id,
                auto_commit,
            },
        )?;
        if auto_commit && !self.auto_commit {
            self.commit_pending();
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn commit(&mut self) -> JdbcResult<()> {
        self.record(Operation::Commit, Event::Commit { connection: self.id })?;
        self.commit_pending();
        Ok(())
    }

    fn rollback(&mut self) -> JdbcResult<()> {
        self.record(Operation::Rollback, Event::Rollback { connection: self.id })?;
        self.pending.clear();
        self.savepoints.clear();
        Ok(())
    }

    fn rollback_to(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        let position = self.find_savepoint(savepoint)?;
        self.record(
            Operation::RollbackTo,
            Event::RollbackTo {
                connection: self.id,
                savepoint: savepoint.identifier().into_owned(),
            },
        )?;
        let mark = self.savepoints[position].1;
        self.pending.truncate(mark);
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    fn set_savepoint(&mut self) -> JdbcResult<Savepoint> {
        self.next_savepoint += 1;
        self.push_savepoint(Savepoint::unnamed(self.next_savepoint, "sp_"))
    }

    fn set_named_savepoint(&mut self, name: &str) -> JdbcResult<Savepoint> {
        self.next_savepoint += 1;
        self.push_savepoint(Savepoint::named(self.next_savepoint, name))
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        let position = self.find_savepoint(savepoint)?;
        self.record(
            Operation::ReleaseSavepoint,
            Event::ReleaseSavepoint {
                connection: self.id,
                savepoint: savepoint.identifier().into_owned(),
            },
        )?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn close(&mut self) -> JdbcResult<()> {
        if self.closed {
            return Ok(());
        }
        self.record(Operation::Close, Event::Close { connection: self.id })?;
        self.closed = true;
        self.pending.clear();
        self.savepoints.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_commit_statements_are_committed_immediately() {
        let source = RecordingSource::new();
        let mut conn = source.get_connection().unwrap();
        conn.execute("INSERT a", &[]).unwrap();
        assert_eq!(source.committed(), vec!["INSERT a"]);
    }

    #[test]
    fn test_manual_commit_and_savepoints() {
        let source = RecordingSource::new();
        let mut conn = source.get_connection().unwrap();
        conn.set_auto_commit(false).unwrap();

        conn.execute("INSERT a", &[]).unwrap();
        let sp = conn.set_savepoint().unwrap();
        conn.execute("INSERT b", &[]).unwrap();
        conn.rollback_to(&sp).unwrap();
        assert!(source.committed().is_empty());

        conn.commit().unwrap();
        assert_eq!(source.committed(), vec!["INSERT a"]);
    }

    #[test]
    fn test_enabling_auto_commit_commits_pending_work() {
        let source = RecordingSource::new();
        let mut conn = source.get_connection().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn.execute("INSERT a", &[]).unwrap();
        conn.set_auto_commit(true).unwrap();
        assert_eq!(source.committed(), vec!["INSERT a"]);
    }

    #[test]
    fn test_injected_failures() {
        let source = RecordingSource::new();
        source.fail_on(Operation::Acquire);
        assert!(source.get_connection().is_err());
        source.clear_failures();

        source.fail_statements_containing("nope");
        let mut conn = source.get_connection().unwrap();
        assert!(conn.execute("INSERT INTO nope", &[]).is_err());
        assert!(conn.execute("INSERT INTO test", &[]).is_ok());
    }

    #[test]
    fn test_closed_connection_rejects_calls() {
        let source = RecordingSource::new();
        let mut conn = source.get_connection().unwrap();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.execute("INSERT a", &[]), Err(JdbcError::Closed)));
        assert_eq!(source.count(Event::is_close), 1);
        assert_eq!(source.open_connections(), 0);
    }
}
