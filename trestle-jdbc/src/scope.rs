//! The scope manager.
//!
//! [`JdbcScope`] runs closures inside auto-commit, transactional and
//! specific-connection scopes. The state of the scopes entered along one call
//! chain lives in a [`ScopeContext`], which is passed by reference instead of
//! being kept in thread-local storage.

use crate::{
    BoxError, CleanupReport, CleanupStep, ConnectionSource, Connection, JdbcError, JdbcResult,
    ScopeConfig, ScopedConnection, ScopedSource, SourceKey,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

// ============================================================================
// Scope Context
// ============================================================================

/// Scope state of one thread of execution.
///
/// A context is neither `Send` nor `Sync`: create one per thread (or per
/// request) with [`JdbcScope::context`] and pass it down the call chain.
#[derive(Default)]
pub struct ScopeContext {
    depth: Cell<usize>,
    connections: RefCell<Vec<(SourceKey, ScopedConnection)>>,
    specific_depth: Cell<usize>,
    specific_connections: RefCell<HashMap<SourceKey, ScopedConnection>>,
}

impl ScopeContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transactional scope is active.
    pub fn is_in_transaction_scope(&self) -> bool {
        self.depth.get() > 0
    }

    /// Current transactional nesting depth, 0 outside any scope.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Whether a specific-connection scope is active.
    pub fn is_in_specific_connection_scope(&self) -> bool {
        self.specific_depth.get() > 0
    }

    /// Number of connections held by the active transactional scope.
    pub fn active_connections(&self) -> usize {
        self.connections.borrow().len()
    }

    /// The transactional connection held for `key`, if any.
    pub fn wrapped_connection(&self, key: &SourceKey) -> Option<ScopedConnection> {
        self.connections
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, conn)| conn.clone())
    }

    /// Root savepoint depth of the transactional connection held for `key`.
    pub fn root_savepoint_depth(&self, key: &SourceKey) -> Option<usize> {
        self.wrapped_connection(key)
            .map(|conn| conn.root_savepoint_depth())
    }

    /// The connection pinned for `key`, if any.
    pub fn pinned_connection(&self, key: &SourceKey) -> Option<ScopedConnection> {
        self.specific_connections.borrow().get(key).cloned()
    }

    fn wrapped(&self) -> Vec<(SourceKey, ScopedConnection)> {
        self.connections.borrow().clone()
    }

    fn register(&self, key: SourceKey, conn: ScopedConnection) {
        self.connections.borrow_mut().push((key, conn));
    }

    fn enter(&self) -> usize {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        depth
    }

    fn leave(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }

    fn clear_transactional(&self) {
        self.connections.borrow_mut().clear();
        self.depth.set(0);
    }

    fn enter_specific(&self, key: SourceKey, conn: &ScopedConnection) {
        self.specific_depth.set(self.specific_depth.get() + 1);
        self.specific_connections
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| conn.clone());
    }

    fn leave_specific(&self) {
        let depth = self.specific_depth.get().saturating_sub(1);
        self.specific_depth.set(depth);
        if depth == 0 {
            self.specific_connections.borrow_mut().clear();
        }
    }
}

impl fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeContext")
            .field("depth", &self.depth.get())
            .field("connections", &self.connections.borrow().len())
            .field("specific_depth", &self.specific_depth.get())
            .finish()
    }
}

// ============================================================================
// Scope Manager
// ============================================================================

/// Runs code in auto-commit, transactional and specific-connection scopes.
///
/// # Example
///
/// ```rust
/// use trestle_jdbc::{Connection, JdbcScope, testing::RecordingSource};
///
/// let jdbc = JdbcScope::default();
/// let source = jdbc.wrap_source(RecordingSource::new());
/// let ctx = jdbc.context();
///
/// jdbc.transactional(&ctx, || {
///     jdbc.auto_commit(&ctx, &source, |conn| conn.execute("INSERT a", &[]))?;
///     jdbc.transactional_on(&ctx, &source, |conn| conn.execute("INSERT b", &[]))
/// })
/// .unwrap();
///
/// assert_eq!(source.inner().committed().len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JdbcScope {
    config: Arc<ScopeConfig>,
}

impl JdbcScope {
    /// Create a scope manager with the given configuration.
    pub fn new(config: ScopeConfig) -> JdbcResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Create a scope manager configured from environment variables.
    pub fn from_env() -> JdbcResult<Self> {
        Self::new(ScopeConfig::from_env()?)
    }

    /// The configuration.
    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Wrap a source so its connections take part in scopes.
    pub fn wrap_source<S: ConnectionSource>(&self, source: S) -> ScopedSource<S> {
        ScopedSource::new(source, self.config.clone())
    }

    /// Create a fresh scope context.
    ///
    /// Convenience for [`ScopeContext::new`]: a context is not tied to the
    /// manager that created it and can be used with any `JdbcScope`.
    pub fn context(&self) -> ScopeContext {
        ScopeContext::new()
    }

    /// Get a connection from `source` for the current scope of `ctx`.
    ///
    /// Scope-aware sources return the pinned connection or the connection of
    /// the active transactional scope when there is one; any other source
    /// returns a fresh plain connection.
    pub fn connection<S>(&self, ctx: &ScopeContext, source: &S) -> JdbcResult<ScopedConnection>
    where
        S: ConnectionSource + ?Sized,
    {
        match source.scope_key() {
            Some(key) => retrieve(ctx, &self.config, key, source),
            None => Ok(ScopedConnection::plain(source.get_connection()?)),
        }
    }

    /// Run `queries` on a connection in auto-commit mode.
    ///
    /// The connection is closed afterwards, unless it belongs to an enclosing
    /// transactional scope: then the work joins that transaction and the
    /// scope decides when it is committed.
    pub fn auto_commit<S, T, E, F>(&self, ctx: &ScopeContext, source: &S, queries: F) -> JdbcResult<T>
    where
        S: ConnectionSource + ?Sized,
        F: FnOnce(&mut ScopedConnection) -> Result<T, E>,
        E: Into<BoxError>,
    {
        let key = source.scope_key();
        if let Some(mut pinned) = key.as_ref().and_then(|k| ctx.pinned_connection(k)) {
            return queries(&mut pinned).map_err(JdbcError::from_callback);
        }

        let mut conn = self.connection(ctx, source)?;
        let result = conn
            .set_auto_commit(true)
            .and_then(|()| queries(&mut conn).map_err(JdbcError::from_callback));

        let mut report = CleanupReport::new();
        if !conn.is_transactional() {
            if let Err(err) = conn.close_physical() {
                report.record(CleanupStep::Close, key, &err);
            }
        }
        result.map_err(|err| err.with_cleanup(report))
    }

    /// Run `scope` in a transactional scope.
    ///
    /// Connections obtained from scope-aware sources inside `scope` share one
    /// transaction per source. Only the outermost scope commits and closes
    /// them. A failing nested scope rolls every connection back to the
    /// savepoint recorded for its own nesting level; a failing outermost
    /// scope rolls the whole transaction back.
    pub fn transactional<T, E, F>(&self, ctx: &ScopeContext, scope: F) -> JdbcResult<T>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<BoxError>,
    {
        let outermost = !ctx.is_in_transaction_scope();
        let depth = ctx.enter();
        let level = LevelGuard {
            ctx,
            depth,
            outermost,
            finished: false,
        };
        trace!(depth, outermost, "entering transactional scope");

        // A new root savepoint for every connection of the enclosing scopes.
        for (key, conn) in ctx.wrapped() {
            if let Err(err) = conn.push_root_savepoint(depth) {
                debug!(source = %key, error = %err, "could not set root savepoint");
                let report = level.finish();
                return Err(err.with_cleanup(report));
            }
        }

        let result = scope().map_err(JdbcError::from_callback);
        let result = match result {
            Ok(value) if outermost => commit_all(ctx).map(|()| value),
            other => other,
        };

        match result {
            Ok(value) => {
                level.finish();
                trace!(depth, "transactional scope completed");
                Ok(value)
            }
            Err(err) => {
                let mut report = rollback_all(ctx, depth, outermost);
                report.extend(level.finish());
                debug!(depth, error = %err, "transactional scope rolled back");
                Err(err.with_cleanup(report))
            }
        }
    }

    /// Run `queries` on the connection of `source` in a transactional scope.
    ///
    /// Fails with [`JdbcError::Setup`] when `source` has not been wrapped with
    /// [`wrap_source`](Self::wrap_source).
    pub fn transactional_on<S, T, E, F>(
        &self,
        ctx: &ScopeContext,
        source: &S,
        queries: F,
    ) -> JdbcResult<T>
    where
        S: ConnectionSource + ?Sized,
        F: FnOnce(&mut ScopedConnection) -> Result<T, E>,
        E: Into<BoxError>,
    {
        let key = scope_key(source)?;
        if let Some(mut pinned) = ctx.pinned_connection(&key) {
            return queries(&mut pinned).map_err(JdbcError::from_callback);
        }

        self.transactional(ctx, || -> JdbcResult<T> {
            let mut conn = retrieve(ctx, &self.config, key, source)?;
            queries(&mut conn).map_err(JdbcError::from_callback)
        })
    }

    /// Run `scope` with `connection` pinned for `source`.
    ///
    /// While the scope runs, every connection request for `source` made
    /// through `ctx` returns `connection`. Only the first pin of a source
    /// counts: nested calls for a source that is already pinned keep the
    /// existing connection. The connection is never closed here.
    pub fn specific_connection<S, T, E, F>(
        &self,
        ctx: &ScopeContext,
        connection: &ScopedConnection,
        source: &S,
        scope: F,
    ) -> JdbcResult<T>
    where
        S: ConnectionSource + ?Sized,
        F: FnOnce() -> Result<T, E>,
        E: Into<BoxError>,
    {
        let key = scope_key(source)?;
        ctx.enter_specific(key, connection);
        let _guard = SpecificGuard { ctx };
        scope().map_err(JdbcError::from_callback)
    }
}

fn scope_key<S: ConnectionSource + ?Sized>(source: &S) -> JdbcResult<SourceKey> {
    source.scope_key().ok_or_else(|| {
        JdbcError::Setup(format!(
            "Only a source wrapped in a ScopedSource can be part of a scope, this one isn't: {}",
            source.name()
        ))
    })
}

/// Connection retrieval shared by [`JdbcScope::connection`] and
/// [`ScopedSource::connection`].
pub(crate) fn retrieve<S>(
    ctx: &ScopeContext,
    config: &Arc<ScopeConfig>,
    key: SourceKey,
    source: &S,
) -> JdbcResult<ScopedConnection>
where
    S: ConnectionSource + ?Sized,
{
    if let Some(pinned) = ctx.pinned_connection(&key) {
        return Ok(pinned);
    }

    if !ctx.is_in_transaction_scope() {
        return Ok(ScopedConnection::plain(source.get_connection()?));
    }

    if let Some(conn) = ctx.wrapped_connection(&key) {
        return Ok(conn);
    }

    let mut raw = source.get_connection()?;
    if let Err(err) = raw.set_auto_commit(false) {
        if let Err(close_err) = raw.close() {
            debug!(source = %key, error = %close_err, "closing connection after failed setup");
        }
        return Err(err);
    }
    let conn = ScopedConnection::transactional(raw, ctx.depth(), config.clone())?;
    debug!(source = %key, depth = ctx.depth(), "acquired connection for transactional scope");
    ctx.register(key, conn.clone());
    Ok(conn)
}

fn commit_all(ctx: &ScopeContext) -> JdbcResult<()> {
    for (key, conn) in ctx.wrapped() {
        trace!(source = %key, "committing");
        conn.commit_physical()?;
    }
    Ok(())
}

/// Undo the work of the failing level `depth` on every wrapped connection.
///
/// The outermost level rolls the whole transaction back; a nested level
/// rolls back to the savepoint recorded for it.
fn rollback_all(ctx: &ScopeContext, depth: usize, outermost: bool) -> CleanupReport {
    let mut report = CleanupReport::new();
    for (key, conn) in ctx.wrapped() {
        let rolled_back = if outermost {
            conn.rollback_physical()
        } else {
            conn.rollback_level(depth)
        };
        if let Err(err) = rolled_back {
            report.record(CleanupStep::Rollback, Some(key), &err);
        }
    }
    report
}

/// Unwinds one transactional nesting level, on every exit path.
struct LevelGuard<'a> {
    ctx: &'a ScopeContext,
    depth: usize,
    outermost: bool,
    finished: bool,
}

impl LevelGuard<'_> {
    fn finish(mut self) -> CleanupReport {
        self.finished = true;
        self.unwind()
    }

    fn unwind(&self) -> CleanupReport {
        let mut report = CleanupReport::new();
        if !self.outermost {
            for (key, conn) in self.ctx.wrapped() {
                if let Err(err) = conn.pop_level(self.depth) {
                    report.record(CleanupStep::PopSavepoint, Some(key), &err);
                }
            }
            self.ctx.leave();
            return report;
        }

        for (key, conn) in self.ctx.wrapped() {
            if let Err(err) = conn.restore_auto_commit() {
                report.record(CleanupStep::RestoreAutoCommit, Some(key.clone()), &err);
            }
            if let Err(err) = conn.close_physical() {
                report.record(CleanupStep::Close, Some(key.clone()), &err);
            }
            trace!(source = %key, "closed connection");
        }
        self.ctx.clear_transactional();
        report
    }
}

impl Drop for LevelGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Unwinding out of the scope: undo this level before releasing it.
            let mut report = rollback_all(self.ctx, self.depth, self.outermost);
            report.extend(self.unwind());
            debug!(depth = self.depth, failures = report.len(), "transactional scope abandoned");
        }
    }
}

struct SpecificGuard<'a> {
    ctx: &'a ScopeContext,
}

impl Drop for SpecificGuard<'_> {
    fn drop(&mut self) {
        self.ctx.leave_specific();
    }
}
