//! Error types for JDBC scopes.

use crate::SourceKey;
use std::fmt;
use thiserror::Error;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when running code inside connection scopes.
#[derive(Error, Debug)]
pub enum JdbcError {
    /// A source that cannot take part in scopes was used where one is required.
    #[error("Scope setup error: {0}")]
    Setup(String),

    /// An application callback failed.
    #[error("Callback failed: {0}")]
    Callback(#[source] BoxError),

    /// An application callback was interrupted.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Connection acquisition or connectivity error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Generic database error reported by a backend.
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite driver error.
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Savepoint bookkeeping error.
    #[error("Savepoint error: {0}")]
    Savepoint(String),

    /// The connection has already been physically closed.
    #[error("Connection is closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A primary error with the cleanup failures suppressed while handling it.
    #[error("{error} ({report})")]
    WithCleanup {
        /// The error that ended the scope.
        #[source]
        error: Box<JdbcError>,
        /// Cleanup steps that failed afterwards.
        report: CleanupReport,
    },
}

/// Result type alias for JDBC scope operations.
pub type JdbcResult<T> = Result<T, JdbcError>;

impl JdbcError {
    /// Convert an application error into a scope error.
    ///
    /// Errors that already are a [`JdbcError`] are returned unchanged so that
    /// nested scopes do not wrap each other's failures.
    pub fn from_callback(err: impl Into<BoxError>) -> Self {
        let err: BoxError = err.into();
        match err.downcast::<JdbcError>() {
            Ok(jdbc) => *jdbc,
            Err(err) => match err.downcast::<std::io::Error>() {
                Ok(io) if io.kind() == std::io::ErrorKind::Interrupted => {
                    JdbcError::Interrupted(io.to_string())
                }
                Ok(io) => JdbcError::Callback(io),
                Err(err) => JdbcError::Callback(err),
            },
        }
    }

    /// Attach cleanup failures to this error. An empty report is a no-op.
    pub fn with_cleanup(self, report: CleanupReport) -> Self {
        if report.is_empty() {
            return self;
        }
        match self {
            JdbcError::WithCleanup {
                error,
                report: mut existing,
            } => {
                existing.extend(report);
                JdbcError::WithCleanup {
                    error,
                    report: existing,
                }
            }
            other => JdbcError::WithCleanup {
                error: Box::new(other),
                report,
            },
        }
    }

    /// The error that ended the scope, without its cleanup report.
    pub fn primary(&self) -> &JdbcError {
        match self {
            JdbcError::WithCleanup { error, .. } => error.primary(),
            other => other,
        }
    }

    /// Cleanup failures suppressed while handling this error.
    pub fn suppressed(&self) -> &[CleanupFailure] {
        match self {
            JdbcError::WithCleanup { report, .. } => report.failures(),
            _ => &[],
        }
    }

    /// Whether this is a setup error.
    pub fn is_setup(&self) -> bool {
        matches!(self.primary(), JdbcError::Setup(_))
    }

    /// Whether this error came from an application callback.
    pub fn is_callback(&self) -> bool {
        matches!(
            self.primary(),
            JdbcError::Callback(_) | JdbcError::Interrupted(_)
        )
    }
}

/// Cleanup step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    /// Rolling back to the current root savepoint.
    Rollback,
    /// Restoring auto-commit mode on the raw connection.
    RestoreAutoCommit,
    /// Physically closing the raw connection.
    Close,
    /// Discarding the root savepoints of a finished nesting level.
    PopSavepoint,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupStep::Rollback => "rollback",
            CleanupStep::RestoreAutoCommit => "restore auto-commit",
            CleanupStep::Close => "close",
            CleanupStep::PopSavepoint => "pop savepoint",
        };
        f.write_str(name)
    }
}

/// One failed cleanup step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// The step that failed.
    pub step: CleanupStep,
    /// The source whose connection failed, if known.
    pub source: Option<SourceKey>,
    /// Rendered error message.
    pub message: String,
}

/// Cleanup failures collected while unwinding a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed step.
    pub fn record(&mut self, step: CleanupStep, source: Option<SourceKey>, err: &JdbcError) {
        tracing::error!(%step, source = ?source, error = %err, "cleanup step failed");
        self.failures.push(CleanupFailure {
            step,
            source,
            message: err.to_string(),
        });
    }

    /// Append the failures of another report.
    pub fn extend(&mut self, other: CleanupReport) {
        self.failures.extend(other.failures);
    }

    /// Whether no step failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failed steps.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// The recorded failures, in order.
    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} suppressed cleanup failure(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.step, failure.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_from_callback_keeps_jdbc_errors() {
        let err = JdbcError::from_callback(JdbcError::Setup("nope".into()));
        assert!(err.is_setup());
    }

    #[test]
    fn test_from_callback_wraps_foreign_errors() {
        let err = JdbcError::from_callback(Boom);
        assert!(err.is_callback());
        assert_eq!(err.to_string(), "Callback failed: boom");
    }

    #[test]
    fn test_from_callback_interrupted() {
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "stop");
        let err = JdbcError::from_callback(io);
        assert!(matches!(err, JdbcError::Interrupted(_)));
    }

    #[test]
    fn test_with_cleanup() {
        let mut report = CleanupReport::new();
        report.record(CleanupStep::Close, None, &JdbcError::Closed);

        let err = JdbcError::Database("bad".into()).with_cleanup(report);
        assert_eq!(err.suppressed().len(), 1);
        assert!(matches!(err.primary(), JdbcError::Database(_)));
        assert!(err.to_string().contains("1 suppressed cleanup failure"));

        let err = JdbcError::Closed.with_cleanup(CleanupReport::new());
        assert!(matches!(err, JdbcError::Closed));
    }
}
