//! Database datasource.
//!
//! Every statement, including the metadata SQL generated here, passes the
//! read-only gate before it reaches the backend. Each metadata operation
//! runs the backend's ordered strategy list from [`crate::adapters::dialect`].

use super::{DatabaseSource, DatasourceContext};
use crate::adapters::{
    DatabaseHandle, FactoryContext, Strategy, TablePath, create_database_connection, dialect,
    first_success,
};
use crate::config::SessionConfig;
use crate::models::QueryResult;
use crate::safety::Query;
use crate::security::ConnectionUrl;
use crate::{Result, error::SourceGateError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Row cap for table listings, which are metadata rather than data.
const TABLE_LIST_LIMIT: usize = 10_000;

const TABLE_COLUMNS: &[&str] = &["table_name", "tablename", "name"];
const SCHEMA_COLUMNS: &[&str] = &[
    "table_schema",
    "schema_name",
    "schemaname",
    "database",
    "databasename",
    "namespace",
];
const CATALOG_COLUMNS: &[&str] = &["table_catalog", "database_name", "catalog", "catalog_name"];

/// A connected database or warehouse.
pub struct DatabaseDatasource {
    url: String,
    handle: DatabaseHandle,
    config: Arc<SessionConfig>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DatabaseDatasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseDatasource")
            .field("url", &self.url)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DatabaseDatasource {
    /// Connects through the driver factory, opening a tunnel when the URL
    /// carries SSH parameters.
    ///
    /// # Errors
    /// Returns the factory's error prefixed with the sanitized URL
    pub async fn connect(url: &ConnectionUrl, context: &DatasourceContext) -> Result<Self> {
        let cancel = context.cancel.child_token();
        let factory = FactoryContext {
            config: &context.config.connection,
            secrets: context.secrets.as_ref(),
            connector: context.connector.as_ref(),
            cancel: &cancel,
        };

        let handle = create_database_connection(url.expose(), &factory)
            .await
            .map_err(|e| e.in_operation("connect to database", url.sanitized()))?;

        tracing::info!(
            url = %url.sanitized(),
            engine = handle.engine(),
            tunnel_port = ?handle.tunnel_port(),
            "Connected to database"
        );

        Ok(Self::from_handle(url.sanitized(), handle, Arc::clone(&context.config), cancel))
    }

    /// Wraps an already connected handle.
    pub fn from_handle(
        sanitized_url: impl Into<String>,
        handle: DatabaseHandle,
        config: Arc<SessionConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url: sanitized_url.into(),
            handle,
            config,
            cancel,
        }
    }

    /// Credential-free URL of this database.
    pub fn sanitized_url(&self) -> &str {
        &self.url
    }

    /// Backend handle.
    pub const fn handle(&self) -> &DatabaseHandle {
        &self.handle
    }

    /// Runs one statement through the gate, under `timeout`, cancellable.
    async fn run(&self, operation: &str, sql: &str, max_rows: usize, timeout: Duration) -> Result<QueryResult> {
        let query = Query::for_backend(self.handle.executor().backend(), sql);
        query.ensure_read_only()?;

        tracing::debug!(url = %self.url, operation, "Executing statement");
        let execute = tokio::time::timeout(timeout, self.handle.executor().execute(query.sql(), max_rows));

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SourceGateError::cancelled(operation)),
            outcome = execute => outcome.map_err(|_| SourceGateError::timeout(operation, timeout))?,
        }
    }

    /// Runs a metadata strategy chain.
    async fn run_strategies(&self, operation: &str, statements: Vec<String>, max_rows: usize) -> Result<QueryResult> {
        let timeout = self.config.connection.query_timeout;
        let strategies = statements
            .into_iter()
            .map(|sql| Strategy::new(strategy_label(&sql), sql))
            .collect();
        first_success(strategies, |sql| async move { self.run(operation, &sql, max_rows, timeout).await }).await
    }

    /// Round trip with `SELECT 1` under the connect timeout.
    ///
    /// # Errors
    /// Returns `Connection` naming the sanitized URL
    pub async fn probe(&self) -> Result<()> {
        let backend = self.handle.executor().backend();
        self.run(
            "probe database",
            dialect::probe(backend),
            1,
            self.config.connection.connect_timeout,
        )
        .await
        .map(|_| ())
        .map_err(|e| {
            SourceGateError::connection_failed("connectivity probe failed", e)
                .in_operation("connect to database", &self.url)
        })
    }

    /// Cancels in-flight statements, then closes the backend and tunnel.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.handle.close().await;
        tracing::debug!(url = %self.url, "Closed database");
    }
}

#[async_trait]
impl DatabaseSource for DatabaseDatasource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let executor = self.handle.executor();
        let statements = dialect::list_tables(executor.backend(), executor.catalog_scope());
        let result = self
            .run_strategies("list tables", statements, TABLE_LIST_LIMIT)
            .await
            .map_err(|e| e.in_operation("list tables", &self.url))?;
        if result.truncated {
            tracing::warn!(url = %self.url, limit = TABLE_LIST_LIMIT, "Table listing truncated");
        }
        Ok(table_names(&result))
    }

    async fn inspect_table(&self, table: &str) -> Result<QueryResult> {
        let operation = format!("inspect table '{table}'");
        let path = TablePath::parse(table).map_err(|e| e.in_operation(&operation, &self.url))?;
        let executor = self.handle.executor();
        let statements = dialect::inspect_table(executor.backend(), &path, executor.catalog_scope());

        let result = self
            .run_strategies(&operation, statements, TABLE_LIST_LIMIT)
            .await
            .map_err(|e| e.in_operation(&operation, &self.url))?;
        if result.is_empty() {
            return Err(SourceGateError::not_found(format!("table '{path}' in {}", self.url)));
        }
        Ok(result)
    }

    async fn sample_table(&self, table: &str, n: Option<usize>) -> Result<QueryResult> {
        let operation = format!("sample table '{table}'");
        let n = n.unwrap_or(self.config.default_sample_size);
        if n == 0 || n > self.config.max_rows {
            return Err(SourceGateError::configuration(format!(
                "sample size must be between 1 and {}, got {n}",
                self.config.max_rows
            )));
        }

        let path = TablePath::parse(table).map_err(|e| e.in_operation(&operation, &self.url))?;
        let statements = dialect::sample_table(self.handle.executor().backend(), &path, n);
        self.run_strategies(&operation, statements, n)
            .await
            .map_err(|e| e.in_operation(&operation, &self.url))
    }

    async fn query(&self, code: &str) -> Result<QueryResult> {
        self.run(
            "query database",
            code,
            self.config.max_rows,
            self.config.connection.query_timeout,
        )
        .await
        .map_err(|e| e.in_operation("query database", &self.url))
    }
}

/// Short name of a metadata statement, used in combined strategy errors.
fn strategy_label(sql: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    if upper.contains("INFORMATION_SCHEMA") {
        "information_schema".to_string()
    } else if upper.contains("SAMPLE") {
        "sampling".to_string()
    } else if upper.contains("PRAGMA_TABLE_INFO") {
        "pragma".to_string()
    } else {
        let mut words = upper.split_whitespace();
        match (words.next(), words.next()) {
            (Some("SHOW"), Some(next)) => format!("show {}", next.to_ascii_lowercase()),
            (Some(first), _) => first.to_ascii_lowercase(),
            (None, _) => "statement".to_string(),
        }
    }
}

/// Extracts qualified table names from a listing result.
///
/// Columns are picked by name so that backend listings with extra columns
/// (`SHOW TABLES` on Snowflake or Databricks) still yield
/// `catalog.schema.table`. Unknown shapes fall back to joining every
/// string cell.
fn table_names(result: &QueryResult) -> Vec<String> {
    let find = |candidates: &[&str]| {
        candidates.iter().find_map(|candidate| {
            result
                .columns
                .iter()
                .position(|column| column.eq_ignore_ascii_case(candidate))
        })
    };

    let Some(table) = find(TABLE_COLUMNS) else {
        return result.qualified_names();
    };
    let parts: Vec<usize> = [find(CATALOG_COLUMNS), find(SCHEMA_COLUMNS), Some(table)]
        .into_iter()
        .flatten()
        .collect();

    result
        .rows
        .iter()
        .filter_map(|row| {
            let names: Vec<&str> = parts
                .iter()
                .filter_map(|index| row.get(*index).and_then(serde_json::Value::as_str))
                .filter(|name| !name.is_empty())
                .collect();
            (!names.is_empty()).then(|| names.join("."))
        })
        .collect()
}
