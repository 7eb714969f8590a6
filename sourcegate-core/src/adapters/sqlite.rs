//! SQLite backend over a sqlx pool.

use super::values::{binary, float, nullable};
use super::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::str::FromStr;

const ENGINE: &str = "sqlite+sqlx";

/// SQLite executor.
pub(crate) struct SqliteExecutor {
    pool: SqlitePool,
}

/// Engine table constructor.
///
/// Opens the database read-only when the connection config asks for it. The
/// file must already exist; SQLite would otherwise create an empty one.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    Box::pin(async move {
        let mut options = SqliteConnectOptions::from_str(url).map_err(|e| {
            SourceGateError::configuration(format!("Invalid SQLite connection string: {e}"))
        })?;
        options = options.create_if_missing(false);
        if config.read_only {
            options = options.read_only(true);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.clamp(1, 100))
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| SourceGateError::connection_failed("failed to open SQLite database", e))?;

        Ok(Box::new(SqliteExecutor { pool }) as Box<dyn QueryExecutor>)
    })
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let mut stream = sqlx::raw_sql(sql).fetch(&self.pool);
        let mut result = QueryResult::default();

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| SourceGateError::query_failed("SQLite rejected the statement", e))?
        {
            if result.columns.is_empty() {
                result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            if result.rows.len() == max_rows {
                result.truncated = true;
                break;
            }
            result.rows.push((0..row.len()).map(|i| decode_value(&row, i)).collect());
        }

        Ok(result)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite values carry their storage class, so four probes cover them.
fn decode_value(row: &SqliteRow, index: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return nullable(v, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return nullable(v, float);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return nullable(v, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return nullable(v, |bytes| binary(&bytes));
    }

    JsonValue::Null
}
