//! The connection contract consumed by scopes.

use crate::JdbcResult;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A SQL value passed as parameter or read back from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Integer content, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A result row.
pub type Row = Vec<Value>;

/// A savepoint set on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Savepoint {
    id: u64,
    name: Option<String>,
    prefix: Cow<'static, str>,
}

impl Savepoint {
    /// An unnamed savepoint, identified by `id`.
    pub fn unnamed(id: u64, prefix: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id,
            name: None,
            prefix: prefix.into(),
        }
    }

    /// A savepoint with a caller-chosen name.
    pub fn named(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
            prefix: Cow::Borrowed(""),
        }
    }

    /// Backend-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Caller-chosen name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The identifier used in `SAVEPOINT` statements.
    pub fn identifier(&self) -> Cow<'_, str> {
        match &self.name {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("{}{}", self.prefix, self.id)),
        }
    }
}

/// A blocking relational database connection.
///
/// This is the contract both the raw backend connections and the
/// [`ScopedConnection`](crate::ScopedConnection) wrapper implement, so code
/// running inside a scope is written against it and does not know whether
/// its calls are intercepted.
pub trait Connection {
    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> JdbcResult<usize>;

    /// Run a query and collect its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> JdbcResult<Vec<Row>>;

    /// Whether the connection commits every statement on its own.
    fn auto_commit(&self) -> JdbcResult<bool>;

    /// Switch auto-commit mode. Turning it on commits an open transaction.
    fn set_auto_commit(&mut self, auto_commit: bool) -> JdbcResult<()>;

    /// Commit the current transaction.
    fn commit(&mut self) -> JdbcResult<()>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> JdbcResult<()>;

    /// Roll back to a savepoint. The savepoint stays valid.
    fn rollback_to(&mut self, savepoint: &Savepoint) -> JdbcResult<()>;

    /// Set an unnamed savepoint.
    fn set_savepoint(&mut self) -> JdbcResult<Savepoint>;

    /// Set a named savepoint.
    fn set_named_savepoint(&mut self, name: &str) -> JdbcResult<Savepoint>;

    /// Release a savepoint and every savepoint set after it.
    fn release_savepoint(&mut self, savepoint: &Savepoint) -> JdbcResult<()>;

    /// Close the connection.
    fn close(&mut self) -> JdbcResult<()>;

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> JdbcResult<usize> {
        (**self).execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> JdbcResult<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn auto_commit(&self) -> JdbcResult<bool> {
        (**self).auto_commit()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> JdbcResult<()> {
        (**self).set_auto_commit(auto_commit)
    }

    fn commit(&mut self) -> JdbcResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> JdbcResult<()> {
        (**self).rollback()
    }

    fn rollback_to(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        (**self).rollback_to(savepoint)
    }

    fn set_savepoint(&mut self) -> JdbcResult<Savepoint> {
        (**self).set_savepoint()
    }

    fn set_named_savepoint(&mut self, name: &str) -> JdbcResult<Savepoint> {
        (**self).set_named_savepoint(name)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> JdbcResult<()> {
        (**self).release_savepoint(savepoint)
    }

    fn close(&mut self) -> JdbcResult<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
