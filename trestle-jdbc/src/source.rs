//! Connection sources and the adapter that routes them through scopes.

use crate::{Connection, JdbcResult, ScopeConfig, ScopeContext, ScopedConnection, SourceKeyPolicy};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a connection source inside a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
    /// A single wrapped source instance.
    Instance(u64),
    /// Every wrapped source of one Rust type.
    TypeName(&'static str),
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Instance(id) => write!(f, "source#{}", id),
            SourceKey::TypeName(name) => f.write_str(name),
        }
    }
}

/// A factory of raw connections, the equivalent of a `DataSource`.
pub trait ConnectionSource {
    /// Acquire a raw connection.
    fn get_connection(&self) -> JdbcResult<Box<dyn Connection>>;

    /// The scope key of this source, if it can take part in scopes.
    ///
    /// Only [`ScopedSource`] returns a key.
    fn scope_key(&self) -> Option<SourceKey> {
        None
    }

    /// Human readable name, used in errors and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<S: ConnectionSource + ?Sized> ConnectionSource for Arc<S> {
    fn get_connection(&self) -> JdbcResult<Box<dyn Connection>> {
        (**self).get_connection()
    }

    fn scope_key(&self) -> Option<SourceKey> {
        (**self).scope_key()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A source wrapped so that its connections take part in scopes.
///
/// Created with [`JdbcScope::wrap_source`](crate::JdbcScope::wrap_source).
/// Calling [`connection`](Self::connection) asks the scope manager for a
/// connection, which returns the pinned or transactional connection when one
/// applies and a fresh plain one otherwise. The raw
/// [`ConnectionSource::get_connection`] still bypasses the scope.
pub struct ScopedSource<S> {
    inner: S,
    key: SourceKey,
    config: Arc<ScopeConfig>,
}

impl<S: ConnectionSource> ScopedSource<S> {
    pub(crate) fn new(inner: S, config: Arc<ScopeConfig>) -> Self {
        let key = match config.source_key {
            SourceKeyPolicy::Instance => {
                SourceKey::Instance(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
            }
            SourceKeyPolicy::TypeName => SourceKey::TypeName(std::any::type_name::<S>()),
        };
        tracing::debug!(source = %key, name = inner.name(), "wrapped connection source");
        Self { inner, key, config }
    }

    /// Get a connection for the current scope of `ctx`.
    pub fn connection(&self, ctx: &ScopeContext) -> JdbcResult<ScopedConnection> {
        crate::scope::retrieve(ctx, &self.config, self.key.clone(), &self.inner)
    }

    /// The key identifying this source in scopes.
    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwrap the source.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ConnectionSource> ConnectionSource for ScopedSource<S> {
    fn get_connection(&self) -> JdbcResult<Box<dyn Connection>> {
        self.inner.get_connection()
    }

    fn scope_key(&self) -> Option<SourceKey> {
        Some(self.key.clone())
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl<S> fmt::Debug for ScopedSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSource")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JdbcScope;
    use crate::testing::RecordingSource;

    #[test]
    fn test_instance_keys_are_distinct() {
        let scope = JdbcScope::default();
        let a = scope.wrap_source(RecordingSource::new());
        let b = scope.wrap_source(RecordingSource::new());
        assert_ne!(a.key(), b.key());
        assert_eq!(a.scope_key(), Some(a.key().clone()));
    }

    #[test]
    fn test_type_name_keys_collide() {
        let scope =
            JdbcScope::new(ScopeConfig::new().source_key(SourceKeyPolicy::TypeName)).unwrap();
        let a = scope.wrap_source(RecordingSource::new());
        let b = scope.wrap_source(RecordingSource::new());
        assert_eq!(a.key(), b.key());
        assert!(a.key().to_string().contains("RecordingSource"));
    }

    #[test]
    fn test_plain_source_has_no_key() {
        let source = RecordingSource::new();
        assert_eq!(source.scope_key(), None);
        assert!(source.name().contains("RecordingSource"));
    }
}
