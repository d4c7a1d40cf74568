//! The connection wrapper handed to code running inside scopes.

use crate::{Connection, JdbcError, JdbcResult, Row, Savepoint, ScopeConfig, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// A root savepoint and the nesting depth that pushed it.
#[derive(Debug, Clone)]
struct RootSavepoint {
    depth: usize,
    savepoint: Savepoint,
}

struct WrappedConnection {
    raw: Box<dyn Connection>,
    transactional: bool,
    /// Stack seen by application code; `close()` pops it.
    root_savepoints: Vec<RootSavepoint>,
    /// One savepoint per nesting level, owned by the scope manager.
    levels: Vec<RootSavepoint>,
    /// Depth of the scope that acquired the connection.
    created_at: usize,
    /// A manager rollback failed; the open transaction must not be committed.
    poisoned: bool,
    next_root_id: u64,
    config: Arc<ScopeConfig>,
}

impl WrappedConnection {
    fn push_root_savepoint(&mut self, depth: usize) -> JdbcResult<()> {
        self.next_root_id += 1;
        let name = format!("{}{}", self.config.savepoint_prefix, self.next_root_id);
        let savepoint = self.raw.set_named_savepoint(&name)?;
        let root = RootSavepoint { depth, savepoint };
        self.levels.push(root.clone());
        self.root_savepoints.push(root);
        Ok(())
    }

    /// Rollback requested by application code.
    ///
    /// Targets the top of the application stack, then the savepoint of the
    /// innermost level once `close()` emptied that stack.
    fn rollback_to_root(&mut self) -> JdbcResult<()> {
        let target = self
            .root_savepoints
            .last()
            .or_else(|| self.levels.last())
            .map(|root| root.savepoint.clone());
        match target {
            Some(savepoint) => self.raw.rollback_to(&savepoint),
            None => self.raw.rollback(),
        }
    }

    fn rollback_level(&mut self, depth: usize) -> JdbcResult<()> {
        let target = self
            .levels
            .iter()
            .find(|root| root.depth == depth)
            .map(|root| root.savepoint.clone());
        match target {
            Some(savepoint) => {
                self.raw.rollback_to(&savepoint)?;
                // Savepoints popped by close() inside the level are valid again.
                self.root_savepoints = self.levels.clone();
                Ok(())
            }
            None if self.created_at >= depth => {
                self.raw.rollback()?;
                self.levels.clear();
                self.root_savepoints.clear();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// A connection decorated to cooperate with the scope manager.
///
/// While it belongs to a transactional scope, `close()`, `commit()`,
/// `set_auto_commit()` and `rollback()` are intercepted: the scope that
/// created the connection decides when it is committed and closed, and a
/// rollback only undoes the work done since the current root savepoint.
/// Outside a transactional scope every call goes straight to the raw
/// connection.
///
/// The handle is cheap to clone; clones share the same raw connection.
#[derive(Clone)]
pub struct ScopedConnection {
    inner: Rc<RefCell<WrappedConnection>>,
}

impl ScopedConnection {
    /// Wrap a connection that is not managed by any transactional scope.
    ///
    /// This is how a connection is prepared for
    /// [`JdbcScope::specific_connection`](crate::JdbcScope::specific_connection).
    /// Every call passes through, and the caller stays responsible for
    /// closing it.
    pub fn plain(raw: Box<dyn Connection>) -> Self {
        Self::wrap(raw, false, 0, Arc::new(ScopeConfig::default()))
    }

    /// Wrap a connection acquired for a transactional scope at `depth`.
    ///
    /// The first root savepoint is set right away; the raw connection is
    /// closed again if that fails.
    pub(crate) fn transactional(
        raw: Box<dyn Connection>,
        depth: usize,
        config: Arc<ScopeConfig>,
    ) -> JdbcResult<Self> {
        let conn = Self::wrap(raw, true, depth, config);
        if let Err(err) = conn.push_root_savepoint(depth) {
            if let Err(close_err) = conn.close_physical() {
                debug!(error = %close_err, "closing connection after failed savepoint");
            }
            return Err(err);
        }
        Ok(conn)
    }

    fn wrap(
        raw: Box<dyn Connection>,
        transactional: bool,
        created_at: usize,
        config: Arc<ScopeConfig>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(WrappedConnection {
                raw,
                transactional,
                root_savepoints: Vec::new(),
                levels: Vec::new(),
                created_at,
                poisoned: false,
                next_root_id: 0,
                config,
            })),
        }
    }

    /// Whether the connection belongs to a transactional scope.
    pub fn is_transactional(&self) -> bool {
        self.inner.borrow().transactional
    }

    /// Number of root savepoints currently stacked.
    pub fn root_savepoint_depth(&self) -> usize {
        self.inner.borrow().root_savepoints.len()
    }

    /// Whether two handles share the same raw connection.
    pub fn same_connection(&self, other: &ScopedConnection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` against the raw connection, bypassing interception.
    ///
    /// The handle is borrowed for the duration of `f`; using this same
    /// connection through another handle from inside `f` panics.
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut dyn Connection) -> R) -> R {
        let mut inner = self.inner.borrow_mut();
        f(inner.raw.as_mut())
    }

    pub(crate) fn push_root_savepoint(&self, depth: usize) -> JdbcResult<()> {
        self.inner.borrow_mut().push_root_savepoint(depth)
    }

    /// Drop the root savepoints pushed at `depth` or deeper and release the
    /// outermost of them on the raw connection.
    pub(crate) fn pop_level(&self, depth: usize) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        let keep = inner
            .levels
            .iter()
            .position(|root| root.depth >= depth)
            .unwrap_or(inner.levels.len());
        let dropped = inner.levels.split_off(keep);
        inner.root_savepoints.retain(|root| root.depth < depth);
        match dropped.into_iter().next() {
            Some(first) => inner.raw.release_savepoint(&first.savepoint),
            None => Ok(()),
        }
    }

    /// Undo the work of the failing nesting level `depth`.
    ///
    /// Rolls back to the savepoint of that level, or fully when the
    /// connection was acquired at that level or deeper.
    pub(crate) fn rollback_level(&self, depth: usize) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        let result = inner.rollback_level(depth);
        if result.is_err() {
            inner.poisoned = true;
        }
        result
    }

    /// Roll back the whole transaction of the raw connection.
    pub(crate) fn rollback_physical(&self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.raw.rollback() {
            Ok(()) => {
                inner.levels.clear();
                inner.root_savepoints.clear();
                inner.poisoned = false;
                Ok(())
            }
            Err(err) => {
                inner.poisoned = true;
                Err(err)
            }
        }
    }

    pub(crate) fn commit_physical(&self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.poisoned {
            return Err(JdbcError::Savepoint(
                "work of a failed scope could not be rolled back".to_string(),
            ));
        }
        inner.raw.commit()?;
        inner.levels.clear();
        inner.root_savepoints.clear();
        Ok(())
    }

    /// Switch the raw connection back to auto-commit mode.
    ///
    /// Skipped after a failed rollback, since enabling auto-commit would
    /// commit the open transaction.
    pub(crate) fn restore_auto_commit(&self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.poisoned {
            debug!("auto-commit not restored after a failed rollback");
            return Ok(());
        }
        inner.raw.set_auto_commit(true)
    }

    pub(crate) fn close_physical(&self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        inner.levels.clear();
        inner.root_savepoints.clear();
        inner.raw.close()
    }
}

impl Connection for ScopedConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> JdbcResult<usize> {
        self.inner.borrow_mut().raw.execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> JdbcResult<Vec<Row>> {
        self.inner.borrow_mut().raw.query(sql, params)
    }

    fn auto_commit(&self) -> JdbcResult<bool> {
        self.inner.borrow().raw.auto_commit()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.transactional {
            debug!("set_auto_commit({}) was prevented by the scoped connection", auto_commit);
            Ok(())
        } else {
            inner.raw.set_auto_commit(auto_commit)
        }
    }

    fn commit(&mut self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.transactional {
            debug!("commit() was prevented by the scoped connection");
            Ok(())
        } else {
            inner.raw.commit()
        }
    }

    fn rollback(&mut self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.transactional {
            inner.rollback_to_root()
        } else {
            inner.raw.rollback()
        }
    }

    fn rollback_to(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        self.inner.borrow_mut().raw.rollback_to(savepoint)
    }

    fn set_savepoint(&mut self) -> JdbcResult<Savepoint> {
        self.inner.borrow_mut().raw.set_savepoint()
    }

    fn set_named_savepoint(&mut self, name: &str) -> JdbcResult<Savepoint> {
        self.inner.borrow_mut().raw.set_named_savepoint(name)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        self.inner.borrow_mut().raw.release_savepoint(savepoint)
    }

    fn close(&mut self) -> JdbcResult<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.transactional {
            return inner.raw.close();
        }
        // Unwrap one level of root savepoint instead of closing.
        if inner.root_savepoints.pop().is_none() && inner.config.strict_close {
            return Err(JdbcError::Savepoint(
                "close() called with no root savepoint left".to_string(),
            ));
        }
        debug!("close() was prevented by the scoped connection");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.borrow().raw.is_closed()
    }
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ScopedConnection")
            .field("transactional", &inner.transactional)
            .field("root_savepoints", &inner.root_savepoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionSource;
    use crate::testing::{Event, Operation, RecordingSource};

    fn transactional(source: &RecordingSource, config: ScopeConfig) -> ScopedConnection {
        let mut raw = source.get_connection().unwrap();
        raw.set_auto_commit(false).unwrap();
        ScopedConnection::transactional(raw, 1, Arc::new(config)).unwrap()
    }

    #[test]
    fn test_transactional_wrapper_starts_with_one_root_savepoint() {
        let source = RecordingSource::new();
        let conn = transactional(&source, ScopeConfig::default());
        assert!(conn.is_transactional());
        assert_eq!(conn.root_savepoint_depth(), 1);
    }

    #[test]
    fn test_plain_wrapper_has_no_savepoint() {
        let source = RecordingSource::new();
        let mut conn = ScopedConnection::plain(source.get_connection().unwrap());
        assert!(!conn.is_transactional());
        assert_eq!(conn.root_savepoint_depth(), 0);

        conn.commit().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(source.count(Event::is_commit), 1);
        assert_eq!(source.count(Event::is_close), 1);
    }

    #[test]
    fn test_commit_and_auto_commit_are_intercepted() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::default());

        conn.commit().unwrap();
        conn.set_auto_commit(true).unwrap();

        assert_eq!(source.count(Event::is_commit), 0);
        assert!(!conn.auto_commit().unwrap());
    }

    #[test]
    fn test_close_pops_instead_of_closing() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::default());

        conn.close().unwrap();
        assert_eq!(conn.root_savepoint_depth(), 0);
        assert!(!conn.is_closed());

        // More closes than scopes are tolerated.
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_strict_close_fails_on_empty_stack() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::new().strict_close(true));

        conn.close().unwrap();
        let err = conn.close().unwrap_err();
        assert!(matches!(err, JdbcError::Savepoint(_)));
    }

    #[test]
    fn test_rollback_goes_to_root_savepoint() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::default());

        conn.execute("INSERT a", &[]).unwrap();
        conn.push_root_savepoint(2).unwrap();
        conn.execute("INSERT b", &[]).unwrap();
        conn.rollback().unwrap();

        let rows = conn.query("SELECT", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(source.count(Event::is_full_rollback), 0);
    }

    #[test]
    fn test_local_savepoints_pass_through() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::default());

        let sp = conn.set_named_savepoint("local").unwrap();
        conn.execute("INSERT a", &[]).unwrap();
        conn.rollback_to(&sp).unwrap();
        conn.release_savepoint(&sp).unwrap();

        assert!(conn.query("SELECT", &[]).unwrap().is_empty());
        assert_eq!(conn.root_savepoint_depth(), 1);
    }

    #[test]
    fn test_pop_level_keeps_outer_savepoints() {
        let source = RecordingSource::new();
        let conn = transactional(&source, ScopeConfig::default());
        conn.push_root_savepoint(2).unwrap();
        conn.push_root_savepoint(3).unwrap();

        conn.pop_level(2).unwrap();
        assert_eq!(conn.root_savepoint_depth(), 1);

        // Nothing left at that level.
        conn.pop_level(2).unwrap();
        assert_eq!(conn.root_savepoint_depth(), 1);
    }

    #[test]
    fn test_rollback_level_ignores_closes() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::default());
        conn.execute("INSERT a", &[]).unwrap();
        conn.close().unwrap();
        conn.push_root_savepoint(2).unwrap();
        conn.execute("INSERT b", &[]).unwrap();
        conn.close().unwrap();
        assert_eq!(conn.root_savepoint_depth(), 0);

        conn.rollback_level(2).unwrap();
        assert_eq!(conn.query("SELECT", &[]).unwrap().len(), 1);
        assert_eq!(source.count(Event::is_full_rollback), 0);
        // The level's savepoints are back on the stack until it is popped.
        assert_eq!(conn.root_savepoint_depth(), 2);
        conn.pop_level(2).unwrap();
        assert_eq!(conn.root_savepoint_depth(), 1);
    }

    #[test]
    fn test_rollback_physical_discards_all_work() {
        let source = RecordingSource::new();
        let conn = transactional(&source, ScopeConfig::default());
        conn.push_root_savepoint(2).unwrap();

        conn.rollback_physical().unwrap();
        assert_eq!(conn.root_savepoint_depth(), 0);
        assert_eq!(source.count(Event::is_full_rollback), 1);
        assert_eq!(source.count(Event::is_rollback_to), 0);
    }

    #[test]
    fn test_failed_level_rollback_blocks_commit() {
        let source = RecordingSource::new();
        let mut conn = transactional(&source, ScopeConfig::default());
        conn.push_root_savepoint(2).unwrap();
        conn.execute("INSERT a", &[]).unwrap();

        source.fail_on(Operation::RollbackTo);
        assert!(conn.rollback_level(2).is_err());
        source.clear_failures();

        let err = conn.commit_physical().unwrap_err();
        assert!(matches!(err, JdbcError::Savepoint(_)));
        conn.restore_auto_commit().unwrap();
        assert!(source.committed().is_empty());
        assert!(!conn.auto_commit().unwrap());

        // A full rollback clears the failure.
        conn.rollback_physical().unwrap();
        conn.commit_physical().unwrap();
        assert!(source.committed().is_empty());
    }
}
