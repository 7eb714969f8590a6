//! Datasource kinds and their operation sets.
//!
//! Each [`DatasourceKind`] has one trait listing the operations callers may
//! run against it. A live source is a [`Datasource`], a tagged enum with one
//! variant per kind; callers reach the operations through
//! [`Datasource::as_database`], [`Datasource::as_api`] and
//! [`Datasource::as_library`], which fail with `NotFound` on the wrong kind.

pub mod api;
pub mod database;
pub mod library;

pub use api::{ApiDatasource, ApiRequest};
pub use database::DatabaseDatasource;
pub use library::{DocumentReader, LibraryDatasource, TextReader};

use crate::classify::classify;
use crate::config::SessionConfig;
use crate::models::{ApiResponse, DatasourceKind, Page, QueryResult};
use crate::search::SearchRequest;
use crate::security::{ConnectionUrl, SecretSource};
use crate::tunnel::TunnelConnector;
use crate::{Result, error::SourceGateError};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Operations on a SQL database or warehouse.
#[async_trait]
pub trait DatabaseSource: Send + Sync {
    /// Lists qualified table names.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Lists tables and ranks them against `request`.
    async fn search_tables(&self, request: &SearchRequest) -> Result<Vec<String>> {
        let tables = self.list_tables().await?;
        request.run(&tables)
    }

    /// Describes the columns of a one to three part table path.
    async fn inspect_table(&self, table: &str) -> Result<QueryResult>;

    /// Returns up to `n` rows of a table; `None` uses the session default.
    async fn sample_table(&self, table: &str, n: Option<usize>) -> Result<QueryResult>;

    /// Runs a read-only statement.
    async fn query(&self, code: &str) -> Result<QueryResult>;
}

/// Operations on an HTTP API described by an OpenAPI document.
#[async_trait]
pub trait ApiSource: Send + Sync {
    /// Every operation as `"METHOD /path"`.
    fn endpoints(&self) -> Vec<String>;

    /// Ranks endpoint names against `request`.
    fn search_endpoints(&self, request: &SearchRequest) -> Result<Vec<String>> {
        request.run(&self.endpoints())
    }

    /// Returns the operation object of one endpoint.
    fn inspect_endpoint(&self, method: &str, path: &str) -> Result<JsonValue>;

    /// Sends a request to the API.
    async fn request(&self, call: ApiRequest) -> Result<ApiResponse>;
}

/// Operations on a directory of documents.
#[async_trait]
pub trait LibrarySource: Send + Sync {
    /// Relative paths of readable documents.
    async fn documents(&self) -> Result<Vec<String>>;

    /// Ranks document paths against `request`.
    async fn search_documents(&self, request: &SearchRequest) -> Result<Vec<String>> {
        let documents = self.documents().await?;
        request.run(&documents)
    }

    /// Document paths matching a glob such as `*.md` or `docs/**/*.txt`.
    async fn glob_documents(&self, pattern: &str) -> Result<Vec<String>>;

    /// Reads one pagination unit of a document.
    async fn read_document(&self, path: &str, pagination: Option<f64>) -> Result<Page>;
}

/// Everything a datasource needs at creation time.
///
/// Cloning is cheap; the session hands a clone to each creation task.
#[derive(Clone)]
pub struct DatasourceContext {
    /// Session limits
    pub config: Arc<SessionConfig>,
    /// Source of `{password}` substitutions
    pub secrets: Arc<dyn SecretSource>,
    /// Opens SSH sessions for tunnelled databases
    pub connector: Arc<dyn TunnelConnector>,
    /// Cancelled when the owning session resets or closes
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for DatasourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceContext")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A live datasource of any kind.
#[derive(Debug)]
pub enum Datasource {
    /// SQL database or warehouse
    Database(DatabaseDatasource),
    /// OpenAPI-described HTTP service
    Api(ApiDatasource),
    /// Directory of documents
    Library(LibraryDatasource),
}

impl Datasource {
    /// Classifies `url`, creates the matching source and probes it.
    ///
    /// A source whose probe fails is closed before the error is returned,
    /// so no broken handle outlives this call.
    ///
    /// # Errors
    /// Returns the classifier or constructor error, `Connection` when the
    /// probe fails, or `Cancelled` when the context is cancelled first
    pub async fn open(url: &ConnectionUrl, context: &DatasourceContext) -> Result<Self> {
        let kind = classify(url.expose())?;
        tracing::debug!(url = %url.sanitized(), kind = %kind, "Opening datasource");

        let create = async {
            let source = match kind {
                DatasourceKind::Database => Self::Database(DatabaseDatasource::connect(url, context).await?),
                DatasourceKind::Api => Self::Api(ApiDatasource::connect(url, context).await?),
                DatasourceKind::Library => Self::Library(LibraryDatasource::open(url, context)?),
            };

            if let Err(e) = source.probe().await {
                source.close().await;
                return Err(e);
            }
            Ok(source)
        };

        let source = tokio::select! {
            biased;
            () = context.cancel.cancelled() => {
                return Err(SourceGateError::cancelled(format!("opening {}", url.sanitized())));
            }
            source = create => source?,
        };

        tracing::info!(url = %source.sanitized_url(), kind = %kind, "Datasource ready");
        Ok(source)
    }

    /// Kind of this source.
    pub const fn kind(&self) -> DatasourceKind {
        match self {
            Self::Database(_) => DatasourceKind::Database,
            Self::Api(_) => DatasourceKind::Api,
            Self::Library(_) => DatasourceKind::Library,
        }
    }

    /// Credential-free URL identifying this source.
    pub fn sanitized_url(&self) -> &str {
        match self {
            Self::Database(source) => source.sanitized_url(),
            Self::Api(source) => source.sanitized_url(),
            Self::Library(source) => source.sanitized_url(),
        }
    }

    /// Database operations.
    ///
    /// # Errors
    /// Returns `NotFound` when this is not a database
    pub fn as_database(&self) -> Result<&dyn DatabaseSource> {
        match self {
            Self::Database(source) => Ok(source),
            other => Err(other.wrong_kind(DatasourceKind::Database)),
        }
    }

    /// API operations.
    ///
    /// # Errors
    /// Returns `NotFound` when this is not an API
    pub fn as_api(&self) -> Result<&dyn ApiSource> {
        match self {
            Self::Api(source) => Ok(source),
            other => Err(other.wrong_kind(DatasourceKind::Api)),
        }
    }

    /// Library operations.
    ///
    /// # Errors
    /// Returns `NotFound` when this is not a library
    pub fn as_library(&self) -> Result<&dyn LibrarySource> {
        match self {
            Self::Library(source) => Ok(source),
            other => Err(other.wrong_kind(DatasourceKind::Library)),
        }
    }

    fn wrong_kind(&self, wanted: DatasourceKind) -> SourceGateError {
        SourceGateError::not_found(format!(
            "{wanted} datasource {} (it is a {} datasource)",
            self.sanitized_url(),
            self.kind()
        ))
    }

    /// Checks that the source is reachable.
    ///
    /// # Errors
    /// Returns `Connection` when the round trip fails
    pub async fn probe(&self) -> Result<()> {
        match self {
            Self::Database(source) => source.probe().await,
            Self::Api(_) => Ok(()),
            Self::Library(source) => source.probe(),
        }
    }

    /// Releases the source's connections and tunnel.
    pub async fn close(&self) {
        match self {
            Self::Database(source) => source.close().await,
            Self::Api(source) => source.close(),
            Self::Library(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::NoSecrets;
    use crate::tunnel::SshConnector;

    fn context() -> DatasourceContext {
        DatasourceContext {
            config: Arc::new(SessionConfig::default()),
            secrets: Arc::new(NoSecrets),
            connector: Arc::new(SshConnector::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_wrong_kind_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let url = ConnectionUrl::new(url::Url::from_directory_path(dir.path()).unwrap().to_string());
        let source = Datasource::open(&url, &context()).await.unwrap();

        assert_eq!(source.kind(), DatasourceKind::Library);
        assert!(source.as_library().is_ok());
        let err = source.as_database().err().unwrap();
        assert!(matches!(err, SourceGateError::NotFound { .. }));
        assert!(err.to_string().contains("library datasource"));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_open() {
        let dir = tempfile::tempdir().unwrap();
        let url = ConnectionUrl::new(url::Url::from_directory_path(dir.path()).unwrap().to_string());
        let context = context();
        context.cancel.cancel();
        let err = Datasource::open(&url, &context).await.unwrap_err();
        assert!(matches!(err, SourceGateError::Cancelled { .. }));
    }
}
