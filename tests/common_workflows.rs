//! Integration tests for common Trestle workflows.
//!
//! These tests go through the facade crate the way an application would.

use trestle::prelude::*;
use trestle::testing::{Event, RecordingSource};

// =============================================================================
// Repository Pattern
// =============================================================================

/// A repository that opens and closes its own connections, unaware of scopes.
struct UserRepository<'a> {
    source: &'a ScopedSource<RecordingSource>,
    ctx: &'a ScopeContext,
}

impl UserRepository<'_> {
    fn create(&self, name: &str) -> JdbcResult<()> {
        let mut conn = self.source.connection(self.ctx)?;
        conn.execute(&format!("INSERT INTO users VALUES ('{}')", name), &[])?;
        conn.commit()?;
        conn.close()
    }
}

#[test]
fn test_repository_calls_share_one_transaction() {
    let scope = JdbcScope::default();
    let source = scope.wrap_source(RecordingSource::new());
    let ctx = scope.context();
    let users = UserRepository {
        source: &source,
        ctx: &ctx,
    };

    scope
        .transactional(&ctx, || {
            users.create("alice")?;
            users.create("bob")?;
            assert!(source.inner().committed().is_empty());
            Ok::<_, JdbcError>(())
        })
        .unwrap();

    assert_eq!(source.inner().committed().len(), 2);
    assert_eq!(source.inner().count(Event::is_acquire), 1);
    assert_eq!(source.inner().count(Event::is_commit), 1);
}

#[test]
fn test_repository_without_scope_commits_each_call() {
    let scope = JdbcScope::default();
    let source = scope.wrap_source(RecordingSource::new());
    let ctx = scope.context();
    let users = UserRepository {
        source: &source,
        ctx: &ctx,
    };

    users.create("alice").unwrap();
    users.create("bob").unwrap();

    assert_eq!(source.inner().count(Event::is_acquire), 2);
    assert_eq!(source.inner().open_connections(), 0);
}

#[test]
fn test_failed_scope_discards_repository_work() {
    let scope = JdbcScope::default();
    let source = scope.wrap_source(RecordingSource::new());
    let ctx = scope.context();
    let users = UserRepository {
        source: &source,
        ctx: &ctx,
    };

    let result = scope.transactional(&ctx, || {
        users.create("alice")?;
        Err::<(), Box<dyn std::error::Error + Send + Sync>>("validation failed".into())
    });

    let err = result.unwrap_err();
    assert!(err.is_callback());
    assert!(source.inner().committed().is_empty());
    assert_eq!(source.inner().open_connections(), 0);
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_invalid_config_is_rejected() {
    let result = JdbcScope::new(ScopeConfig::new().savepoint_prefix("bad prefix"));
    assert!(matches!(result, Err(JdbcError::Config(_))));
}

// =============================================================================
// SQLite
// =============================================================================

#[cfg(feature = "sqlite")]
#[test]
fn test_sqlite_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let scope = JdbcScope::default();
    let source = scope.wrap_source(SqliteSource::new(SqliteConfig::new(
        dir.path().join("app.db"),
    )));
    let ctx = scope.context();

    scope
        .auto_commit(&ctx, &source, |conn| {
            conn.execute("CREATE TABLE users (name TEXT NOT NULL)", &[])
        })
        .unwrap();

    scope
        .transactional_on(&ctx, &source, |conn| {
            conn.execute("INSERT INTO users VALUES (?1)", &[Value::from("alice")])?;
            conn.execute("INSERT INTO users VALUES (?1)", &[Value::from("bob")])
        })
        .unwrap();

    let rows = scope
        .auto_commit(&ctx, &source, |conn| {
            conn.query("SELECT name FROM users ORDER BY name", &[])
        })
        .unwrap();
    assert_eq!(
        rows,
        vec![vec![Value::from("alice")], vec![Value::from("bob")]]
    );
}
