//! # Trestle JDBC
//!
//! Nested transaction scopes over plain connection sources.
//!
//! Code inside a scope keeps asking its sources for connections and closing
//! them as usual. The scope manager hands out one shared connection per
//! source, turns inner scopes into savepoints and commits or rolls back
//! everything when the outermost scope ends.
//!
//! ## Features
//!
//! - **Nested Scopes**: Inner scopes roll back to their own savepoint on failure
//! - **Multiple Sources**: Every source in a scope gets one connection
//! - **Pinned Connections**: Reuse a connection you already hold
//! - **Scoped Connections**: `commit`/`close` become no-ops or savepoint pops
//! - **SQLite Backend**: Built on `rusqlite` (feature `sqlite`)
//!
//! ## Quick Start
//!
//! ```rust
//! use trestle_jdbc::testing::RecordingSource;
//! use trestle_jdbc::{Connection, JdbcError, JdbcScope};
//!
//! let scope = JdbcScope::default();
//! let source = scope.wrap_source(RecordingSource::new());
//! let ctx = scope.context();
//!
//! scope.transactional(&ctx, || {
//!     let mut conn = source.connection(&ctx)?;
//!     conn.execute("INSERT INTO users VALUES (1)", &[])?;
//!     conn.close()?;
//!
//!     scope.transactional(&ctx, || {
//!         let mut conn = source.connection(&ctx)?;
//!         conn.execute("INSERT INTO users VALUES (2)", &[])?;
//!         Ok::<_, JdbcError>(())
//!     })
//! })
//! .unwrap();
//!
//! assert_eq!(source.inner().committed().len(), 2);
//! ```
//!
//! ## Failure Handling
//!
//! ```rust
//! use trestle_jdbc::testing::RecordingSource;
//! use trestle_jdbc::{Connection, JdbcError, JdbcScope};
//!
//! let scope = JdbcScope::default();
//! let source = scope.wrap_source(RecordingSource::new());
//! let ctx = scope.context();
//!
//! scope.transactional(&ctx, || {
//!     source.connection(&ctx)?.execute("INSERT INTO users VALUES (1)", &[])?;
//!
//!     let inner = scope.transactional(&ctx, || {
//!         source.connection(&ctx)?.execute("INSERT INTO users VALUES (2)", &[])?;
//!         Err::<(), _>(JdbcError::Database("boom".into()))
//!     });
//!     assert!(inner.is_err());
//!     Ok::<_, JdbcError>(())
//! })
//! .unwrap();
//!
//! assert_eq!(source.inner().committed(), vec!["INSERT INTO users VALUES (1)"]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod connection;
mod error;
mod scope;
mod source;
#[cfg(feature = "sqlite")]
mod sqlite;
mod wrapper;

pub mod testing;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use scope::*;
pub use source::*;
#[cfg(feature = "sqlite")]
pub use sqlite::*;
pub use wrapper::*;

// Re-export rusqlite for convenience
#[cfg(feature = "sqlite")]
pub use rusqlite;
