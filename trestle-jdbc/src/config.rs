//! Configuration for JDBC scopes.

use crate::{JdbcError, JdbcResult};
use serde::{Deserialize, Serialize};
#[cfg(feature = "sqlite")]
use std::path::PathBuf;
#[cfg(feature = "sqlite")]
use std::time::Duration;

/// How connection sources are told apart inside a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKeyPolicy {
    /// Every wrapped source instance gets its own connection.
    #[default]
    Instance,
    /// Sources of the same Rust type share one connection per scope.
    TypeName,
}

impl SourceKeyPolicy {
    /// Parse a policy name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "instance" => Some(SourceKeyPolicy::Instance),
            "type" | "type_name" | "typename" => Some(SourceKeyPolicy::TypeName),
            _ => None,
        }
    }
}

/// Configuration shared by a [`JdbcScope`](crate::JdbcScope) and the
/// sources and connections it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Fail when `close()` is called on a transactional connection whose
    /// root savepoint stack is already empty.
    #[serde(default)]
    pub strict_close: bool,

    /// Keying of connection sources.
    #[serde(default)]
    pub source_key: SourceKeyPolicy,

    /// Prefix for the names of the root savepoints set by scopes.
    #[serde(default = "default_savepoint_prefix")]
    pub savepoint_prefix: String,
}

fn default_savepoint_prefix() -> String {
    "trestle_sp_".to_string()
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            strict_close: false,
            source_key: SourceKeyPolicy::default(),
            savepoint_prefix: default_savepoint_prefix(),
        }
    }
}

impl ScopeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables.
    ///
    /// Uses the following environment variables:
    /// - `TRESTLE_JDBC_STRICT_CLOSE`: `1`/`true` to enable strict close
    /// - `TRESTLE_JDBC_SOURCE_KEY`: `instance` or `type_name`
    /// - `TRESTLE_JDBC_SAVEPOINT_PREFIX`: savepoint name prefix
    pub fn from_env() -> JdbcResult<Self> {
        let mut config = Self::default();

        if let Ok(strict) = std::env::var("TRESTLE_JDBC_STRICT_CLOSE") {
            config.strict_close = strict == "1" || strict.eq_ignore_ascii_case("true");
        }

        if let Ok(policy) = std::env::var("TRESTLE_JDBC_SOURCE_KEY") {
            config.source_key = SourceKeyPolicy::parse(&policy).ok_or_else(|| {
                JdbcError::Config(format!("Invalid TRESTLE_JDBC_SOURCE_KEY: {}", policy))
            })?;
        }

        if let Ok(prefix) = std::env::var("TRESTLE_JDBC_SAVEPOINT_PREFIX") {
            config.savepoint_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> JdbcResult<()> {
        let mut chars = self.savepoint_prefix.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if !valid {
            return Err(JdbcError::Config(format!(
                "Savepoint prefix must be a SQL identifier: {:?}",
                self.savepoint_prefix
            )));
        }
        Ok(())
    }

    /// Enable or disable strict close.
    pub fn strict_close(mut self, strict: bool) -> Self {
        self.strict_close = strict;
        self
    }

    /// Set the source keying policy.
    pub fn source_key(mut self, policy: SourceKeyPolicy) -> Self {
        self.source_key = policy;
        self
    }

    /// Set the savepoint name prefix.
    pub fn savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.savepoint_prefix = prefix.into();
        self
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Configuration for a [`SqliteSource`](crate::SqliteSource).
#[cfg(feature = "sqlite")]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path of the database file.
    pub path: PathBuf,

    /// How long a connection waits for a locked database.
    #[serde(default = "default_busy_timeout")]
    #[serde(with = "duration_secs")]
    pub busy_timeout: Duration,

    /// Open connections read-only.
    #[serde(default)]
    pub read_only: bool,

    /// Enforce foreign key constraints.
    #[serde(default = "default_foreign_keys")]
    pub foreign_keys: bool,
}

#[cfg(feature = "sqlite")]
fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

#[cfg(feature = "sqlite")]
fn default_foreign_keys() -> bool {
    true
}

#[cfg(feature = "sqlite")]
impl SqliteConfig {
    /// Create a configuration for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: default_busy_timeout(),
            read_only: false,
            foreign_keys: default_foreign_keys(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Uses the following environment variables:
    /// - `DATABASE_PATH`: Required database file path
    /// - `DATABASE_BUSY_TIMEOUT`: Busy timeout in seconds
    pub fn from_env() -> JdbcResult<Self> {
        let path = std::env::var("DATABASE_PATH")
            .map_err(|_| JdbcError::Config("DATABASE_PATH not set".into()))?;

        let mut config = Self::new(path);

        if let Ok(timeout) = std::env::var("DATABASE_BUSY_TIMEOUT") {
            config.busy_timeout = Duration::from_secs(
                timeout
                    .parse()
                    .map_err(|_| JdbcError::Config("Invalid DATABASE_BUSY_TIMEOUT".into()))?,
            );
        }

        Ok(config)
    }

    /// Set the busy timeout.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Open connections read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enable or disable foreign key enforcement.
    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// Durations serialized as whole seconds.
#[cfg(feature = "sqlite")]
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
