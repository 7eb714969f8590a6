//! Connection and session configuration.
//!
//! Neither struct stores credentials. Secrets travel inside the connection
//! URL (see [`crate::security`]) and are never serialized or displayed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on rows returned by any query or sample.
pub const MAX_DATA_ROWS: usize = 100;

/// Default number of rows returned by a table sample.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// Default ceiling on documents found by one library walk.
pub const DEFAULT_LIBRARY_WALK_LIMIT: usize = 100_000;

/// Configuration applied to every backend connection.
///
/// # Example
/// ```rust
/// use sourcegate_core::config::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_max_connections(4);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection establishment and probe timeout
    pub connect_timeout: Duration,
    /// Per-statement execution timeout
    pub query_timeout: Duration,
    /// SSH handshake timeout
    pub ssh_timeout: Duration,
    /// Maximum number of connections in a backend pool
    pub max_connections: u32,
    /// Whether sessions are opened read-only where the backend supports it
    pub read_only: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            ssh_timeout: Duration::from_secs(15),
            max_connections: 10,
            read_only: true,
        }
    }
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConnectionConfig(connect={}s, query={}s, ssh={}s, pool={}, read_only={})",
            self.connect_timeout.as_secs(),
            self.query_timeout.as_secs(),
            self.ssh_timeout.as_secs(),
            self.max_connections,
            self.read_only
        )
    }
}

impl ConnectionConfig {
    /// Validates connection configuration parameters.
    ///
    /// # Errors
    /// Returns error if configuration values are invalid or unsafe
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(crate::error::SourceGateError::configuration(
                "max_connections must be greater than 0",
            ));
        }

        if self.max_connections > 100 {
            return Err(crate::error::SourceGateError::configuration(
                "max_connections should not exceed 100",
            ));
        }

        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("query_timeout", self.query_timeout),
            ("ssh_timeout", self.ssh_timeout),
        ] {
            if value.is_zero() {
                return Err(crate::error::SourceGateError::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Builder method to set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to set the query timeout.
    #[must_use]
    pub const fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Builder method to set the SSH handshake timeout.
    #[must_use]
    pub const fn with_ssh_timeout(mut self, timeout: Duration) -> Self {
        self.ssh_timeout = timeout;
        self
    }

    /// Builder method to set the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Builder method to toggle read-only session settings.
    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Limits and defaults for one caller session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backend connection settings
    pub connection: ConnectionConfig,
    /// Rows returned by queries and samples are truncated to this count
    pub max_rows: usize,
    /// Sample size used when the caller does not pass one
    pub default_sample_size: usize,
    /// Characters per pagination unit when reading documents
    pub document_chunk_chars: usize,
    /// Timeout for HTTP requests against API sources
    pub http_timeout: Duration,
    /// Documents a library walk may find before it fails instead of
    /// returning a partial listing
    pub library_walk_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_rows: MAX_DATA_ROWS,
            default_sample_size: DEFAULT_SAMPLE_SIZE,
            document_chunk_chars: 10_000,
            http_timeout: Duration::from_secs(30),
            library_walk_limit: DEFAULT_LIBRARY_WALK_LIMIT,
        }
    }
}

impl SessionConfig {
    /// Validates the session limits and the nested connection config.
    ///
    /// # Errors
    /// Returns error if a limit is zero or the sample default exceeds the row cap
    pub fn validate(&self) -> crate::Result<()> {
        self.connection.validate()?;

        if self.max_rows == 0 {
            return Err(crate::error::SourceGateError::configuration(
                "max_rows must be greater than 0",
            ));
        }
        if self.default_sample_size == 0 || self.default_sample_size > self.max_rows {
            return Err(crate::error::SourceGateError::configuration(format!(
                "default_sample_size must be between 1 and {}",
                self.max_rows
            )));
        }
        if self.document_chunk_chars == 0 {
            return Err(crate::error::SourceGateError::configuration(
                "document_chunk_chars must be greater than 0",
            ));
        }
        if self.http_timeout.is_zero() {
            return Err(crate::error::SourceGateError::configuration(
                "http_timeout must be greater than 0",
            ));
        }
        if self.library_walk_limit == 0 {
            return Err(crate::error::SourceGateError::configuration(
                "library_walk_limit must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Builder method to replace the connection config.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Builder method to set the document unit size.
    #[must_use]
    pub const fn with_document_chunk_chars(mut self, chars: usize) -> Self {
        self.document_chunk_chars = chars;
        self
    }

    /// Builder method to set the HTTP timeout.
    #[must_use]
    pub const fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 10);
        assert!(config.read_only);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_config_validation() {
        let config = ConnectionConfig::default().with_max_connections(0);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::default().with_max_connections(101);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::default().with_ssh_timeout(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ssh_timeout"));
    }

    #[test]
    fn test_display_is_credential_free() {
        let display = ConnectionConfig::default().to_string();
        assert!(display.starts_with("ConnectionConfig("));
        assert!(display.contains("pool=10"));
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_rows, MAX_DATA_ROWS);
        assert_eq!(config.default_sample_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_config_rejects_oversized_sample_default() {
        let config = SessionConfig {
            default_sample_size: MAX_DATA_ROWS + 1,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
