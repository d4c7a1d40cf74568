// Trestle - nested transaction scopes for connection-based database access
//
// This library lets code that acquires and closes connections on its own take
// part in enclosing transactions, with inner scopes mapped onto savepoints.

// Re-export the scope manager
#[cfg(feature = "jdbc")]
pub use trestle_jdbc::*;

// Re-export optional crates
#[cfg(feature = "jdbc")]
pub use trestle_jdbc;

// Prelude for common imports
#[cfg(feature = "jdbc")]
pub mod prelude {
    pub use crate::{
        Connection,
        ConnectionSource,
        JdbcError,
        JdbcResult,
        JdbcScope,
        ScopeConfig,
        ScopeContext,
        ScopedConnection,
        ScopedSource,
        Value,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::{SqliteConfig, SqliteSource};
}
