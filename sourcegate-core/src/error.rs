//! Error types with credential sanitization.
//!
//! Every error raised by this crate names the operation that failed and the
//! *sanitized* form of the source URL. Raw connection strings never reach an
//! error message.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, cloneable error source.
///
/// Sources are reference counted so that a single failure can be handed to
/// every caller waiting on the same connection attempt.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Main error type for sourcegate operations.
#[derive(Debug, Clone, Error)]
pub enum SourceGateError {
    /// URL scheme or path cannot be mapped to a datasource kind
    #[error("Unsupported URL '{url}': {reason}")]
    UnsupportedUrl { url: String, reason: String },

    /// Unknown driver, driver compiled out, or tunnel requested for a
    /// backend without a plain host:port
    #[error("Unsupported backend '{backend}': {reason}")]
    UnsupportedBackend { backend: String, reason: String },

    /// Connectivity probe or connection setup failed
    #[error("Connection failed: {context}{}", source_suffix(.source))]
    Connection {
        context: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// SSH handshake, local bind or forwarding failure
    #[error("SSH tunnel error: {context}{}", source_suffix(.source))]
    Tunnel {
        context: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// Statement rejected by the read-only gate
    #[error("Query rejected: {context}")]
    QuerySafety { context: String },

    /// Invalid search pattern or unknown search mode
    #[error("Search error: {message}")]
    SearchMode { message: String },

    /// Registry miss, wrong datasource kind, or unknown endpoint/document
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Configuration or validation error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Driver-level query execution failure
    #[error("Query execution failed: {context}{}", source_suffix(.source))]
    Query {
        context: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// HTTP request failure
    #[error("Request failed: {context}{}", source_suffix(.source))]
    Request {
        context: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// Document could not be read or decoded
    #[error("Document error: {context}{}", source_suffix(.source))]
    Document {
        context: String,
        #[source]
        source: Option<ErrorSource>,
    },

    /// Operation exceeded its timeout
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    /// Operation was cancelled before it completed
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// The async engine for a driver is not available in this build
    #[error("Async engine unavailable for '{driver}': {reason}")]
    AsyncUnavailable { driver: String, reason: String },

    /// I/O operation failed
    #[error("I/O operation failed: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Serialization or deserialization failed
    #[error("Serialization failed: {context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: ErrorSource,
    },
}

/// Convenience type alias for Results with SourceGateError
pub type Result<T> = std::result::Result<T, SourceGateError>;

fn source_suffix(source: &Option<ErrorSource>) -> String {
    source
        .as_ref()
        .map_or_else(String::new, |err| format!(": {err}"))
}

fn shared<E>(error: E) -> Option<ErrorSource>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Some(Arc::new(error))
}

impl SourceGateError {
    /// Creates an unsupported URL error.
    pub fn unsupported_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported backend error.
    pub fn unsupported_backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedBackend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Creates a connection error wrapping a driver error.
    pub fn connection_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            context: context.into(),
            source: shared(error),
        }
    }

    /// Creates a connection error without an underlying source.
    pub fn connection(context: impl Into<String>) -> Self {
        Self::Connection {
            context: context.into(),
            source: None,
        }
    }

    /// Creates a tunnel error wrapping a lower-level failure.
    pub fn tunnel_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Tunnel {
            context: context.into(),
            source: shared(error),
        }
    }

    /// Creates a tunnel error without an underlying source.
    pub fn tunnel(context: impl Into<String>) -> Self {
        Self::Tunnel {
            context: context.into(),
            source: None,
        }
    }

    /// Creates a query safety rejection.
    pub fn query_safety(context: impl Into<String>) -> Self {
        Self::QuerySafety {
            context: context.into(),
        }
    }

    /// Creates a search error.
    pub fn search_mode(message: impl Into<String>) -> Self {
        Self::SearchMode {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a query execution error wrapping a driver error.
    pub fn query_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Query {
            context: context.into(),
            source: shared(error),
        }
    }

    /// Creates a query execution error without an underlying source.
    pub fn query(context: impl Into<String>) -> Self {
        Self::Query {
            context: context.into(),
            source: None,
        }
    }

    /// Creates an HTTP request error.
    pub fn request_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Request {
            context: context.into(),
            source: shared(error),
        }
    }

    /// Creates an HTTP request error without an underlying source.
    pub fn request(context: impl Into<String>) -> Self {
        Self::Request {
            context: context.into(),
            source: None,
        }
    }

    /// Creates a document error wrapping a reader failure.
    pub fn document_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Document {
            context: context.into(),
            source: shared(error),
        }
    }

    /// Creates a document error without an underlying source.
    pub fn document(context: impl Into<String>) -> Self {
        Self::Document {
            context: context.into(),
            source: None,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Signals that a driver's async engine is missing from this build.
    pub fn async_unavailable(driver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AsyncUnavailable {
            driver: driver.into(),
            reason: reason.into(),
        }
    }

    /// Creates an I/O error with context.
    pub fn io(context: impl Into<String>, error: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(error),
        }
    }

    /// Creates a serialization error with context.
    pub fn serialization<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            context: context.into(),
            source: Arc::new(error),
        }
    }

    /// Prefixes the error with the failed operation and the sanitized URL.
    ///
    /// Produces messages of the form
    /// `Failed to sample table 'users' in postgresql://u:***@db/app: ...`.
    /// Unsupported URL/backend, search and not-found errors already name
    /// their subject and pass through unchanged.
    #[must_use]
    pub fn in_operation(self, operation: &str, sanitized_url: &str) -> Self {
        let prefix = format!("Failed to {operation} in {sanitized_url}");
        match self {
            Self::Connection { context, source } => Self::Connection {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::Tunnel { context, source } => Self::Tunnel {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::QuerySafety { context } => Self::QuerySafety {
                context: format!("{prefix}: {context}"),
            },
            Self::Query { context, source } => Self::Query {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::Request { context, source } => Self::Request {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::Document { context, source } => Self::Document {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::Io { context, source } => Self::Io {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::Serialization { context, source } => Self::Serialization {
                context: format!("{prefix}: {context}"),
                source,
            },
            Self::Timeout {
                operation: inner,
                after,
            } => Self::Timeout {
                operation: format!("{prefix}: {inner}"),
                after,
            },
            other => other,
        }
    }

    /// Returns true when the error is a read-only gate rejection.
    pub const fn is_query_safety(&self) -> bool {
        matches!(self, Self::QuerySafety { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_error_includes_source_message() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = SourceGateError::connection_failed("probe postgresql://u:***@db/app", io);
        let message = err.to_string();
        assert!(message.contains("probe postgresql://u:***@db/app"));
        assert!(message.ends_with(": refused"));
    }

    #[test]
    fn test_in_operation_prefixes_context() {
        let err = SourceGateError::query("syntax error at or near \"SELEC\"")
            .in_operation("query database", "postgresql://u:***@db/app");
        assert_eq!(
            err.to_string(),
            "Query execution failed: Failed to query database in postgresql://u:***@db/app: \
             syntax error at or near \"SELEC\""
        );
    }

    #[test]
    fn test_in_operation_leaves_not_found_untouched() {
        let err = SourceGateError::not_found("endpoint GET /pets")
            .in_operation("inspect endpoint", "https://api.example.com");
        assert_eq!(err.to_string(), "Not found: endpoint GET /pets");
    }

    #[test]
    fn test_errors_are_cloneable_with_shared_source() {
        let io = std::io::Error::other("boom");
        let err = SourceGateError::tunnel_failed("handshake", io);
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(std::error::Error::source(&copy).is_some());
    }

    #[test]
    fn test_timeout_display() {
        let err = SourceGateError::timeout("SSH handshake", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "SSH handshake timed out after 1500ms");
    }
}
