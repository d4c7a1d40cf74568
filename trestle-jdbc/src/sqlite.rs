//! SQLite backend built on `rusqlite`.
//!
//! SQLite has no connection-level auto-commit switch, so [`SqliteConnection`]
//! emulates one: turning auto-commit off opens a transaction with `BEGIN`,
//! and `commit`/`rollback` in manual mode immediately open the next one.
//! Savepoints map onto `SAVEPOINT`, `ROLLBACK TO SAVEPOINT` and
//! `RELEASE SAVEPOINT`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use trestle_jdbc::{Connection, JdbcScope, SqliteConfig, SqliteSource};
//!
//! # fn main() -> Result<(), trestle_jdbc::JdbcError> {
//! let scope = JdbcScope::default();
//! let source = scope.wrap_source(SqliteSource::new(SqliteConfig::new("app.db")));
//! let ctx = scope.context();
//!
//! scope.transactional(&ctx, || {
//!     let mut conn = source.connection(&ctx)?;
//!     conn.execute("INSERT INTO users (name) VALUES (?1)", &["alice".into()])?;
//!     Ok::<_, trestle_jdbc::JdbcError>(())
//! })?;
//! # Ok(())
//! # }
//! ```

use crate::{Connection, ConnectionSource, JdbcError, JdbcResult, Row, Savepoint, SqliteConfig, Value};
use rusqlite::OpenFlags;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use std::fmt;

const SAVEPOINT_PREFIX: &str = "sqlite_sp_";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
        })
    }
}

impl From<rusqlite::types::Value> for Value {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(i) => Value::Integer(i),
            rusqlite::types::Value::Real(f) => Value::Real(f),
            rusqlite::types::Value::Text(s) => Value::Text(s),
            rusqlite::types::Value::Blob(b) => Value::Blob(b),
        }
    }
}

/// Quote an identifier for use in a savepoint statement.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A [`ConnectionSource`] opening SQLite connections.
///
/// Every call opens a new connection to the configured database file.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    config: SqliteConfig,
}

impl SqliteSource {
    /// Create a source for the given configuration.
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }

    /// Create a source from environment variables.
    pub fn from_env() -> JdbcResult<Self> {
        Ok(Self::new(SqliteConfig::from_env()?))
    }

    /// The configuration of this source.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Open a concrete connection.
    pub fn open(&self) -> JdbcResult<SqliteConnection> {
        SqliteConnection::open(&self.config)
    }
}

impl ConnectionSource for SqliteSource {
    fn get_connection(&self) -> JdbcResult<Box<dyn Connection>> {
        Ok(Box::new(self.open()?))
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

/// A SQLite connection with emulated auto-commit.
pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
    auto_commit: bool,
    next_savepoint: u64,
}

impl SqliteConnection {
    /// Open a connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> JdbcResult<Self> {
        let flags = if config.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::default()
        };

        let conn = rusqlite::Connection::open_with_flags(&config.path, flags).map_err(|e| {
            JdbcError::Connection(format!("Failed to open {}: {}", config.path.display(), e))
        })?;
        conn.busy_timeout(config.busy_timeout)?;
        if config.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON")?;
        }

        tracing::debug!(path = %config.path.display(), "opened sqlite connection");
        Ok(Self::from_rusqlite(conn))
    }

    /// Adopt an already open `rusqlite` connection.
    ///
    /// The connection must not be inside a transaction.
    pub fn from_rusqlite(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Some(conn),
            auto_commit: true,
            next_savepoint: 0,
        }
    }

    /// The underlying `rusqlite` connection.
    pub fn inner(&self) -> JdbcResult<&rusqlite::Connection> {
        self.conn.as_ref().ok_or(JdbcError::Closed)
    }

    fn in_transaction(&self) -> JdbcResult<bool> {
        Ok(!self.inner()?.is_autocommit())
    }

    fn batch(&self, sql: &str) -> JdbcResult<()> {
        tracing::trace!(sql, "sqlite statement");
        self.inner()?.execute_batch(sql)?;
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> JdbcResult<usize> {
        let conn = self.inner()?;
        Ok(conn.execute(sql, rusqlite::params_from_iter(params.iter()))?)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> JdbcResult<Vec<Row>> {
        let conn = self.inner()?;
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            (0..columns)
                .map(|i| row.get::<_, rusqlite::types::Value>(i).map(Value::from))
                .collect::<rusqlite::Result<Row>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn auto_commit(&self) -> JdbcResult<bool> {
        self.inner()?;
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> JdbcResult<()> {
        if auto_commit == self.auto_commit {
            self.inner()?;
            return Ok(());
        }

        if auto_commit {
            if self.in_transaction()? {
                self.batch("COMMIT")?;
            }
        } else if !self.in_transaction()? {
            self.batch("BEGIN")?;
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn commit(&mut self) -> JdbcResult<()> {
        if self.in_transaction()? {
            self.batch("COMMIT")?;
        }
        if !self.auto_commit {
            self.batch("BEGIN")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> JdbcResult<()> {
        if self.in_transaction()? {
            self.batch("ROLLBACK")?;
        }
        if !self.auto_commit {
            self.batch("BEGIN")?;
        }
        Ok(())
    }

    fn rollback_to(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        self.batch(&format!(
            "ROLLBACK TO SAVEPOINT {}",
            quote_identifier(&savepoint.identifier())
        ))
    }

    fn set_savepoint(&mut self) -> JdbcResult<Savepoint> {
        self.next_savepoint += 1;
        let savepoint = Savepoint::unnamed(self.next_savepoint, SAVEPOINT_PREFIX);
        self.batch(&format!("SAVEPOINT {}", quote_identifier(&savepoint.identifier())))?;
        Ok(savepoint)
    }

    fn set_named_savepoint(&mut self, name: &str) -> JdbcResult<Savepoint> {
        self.next_savepoint += 1;
        let savepoint = Savepoint::named(self.next_savepoint, name);
        self.batch(&format!("SAVEPOINT {}", quote_identifier(name)))?;
        Ok(savepoint)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        self.batch(&format!(
            "RELEASE SAVEPOINT {}",
            quote_identifier(&savepoint.identifier())
        ))
    }

    fn close(&mut self) -> JdbcResult<()> {
        if let Some(conn) = self.conn.take() {
            if let Err((conn, e)) = conn.close() {
                self.conn = Some(conn);
                return Err(e.into());
            }
            tracing::debug!("closed sqlite connection");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("open", &self.conn.is_some())
            .field("auto_commit", &self.auto_commit)
            .finish()
    }
}
