//! MySQL and MariaDB backend over a sqlx pool.

use super::values::{binary, float, nullable};
use super::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult, security::sanitize_url};
use async_trait::async_trait;
use futures::TryStreamExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};

const ENGINE: &str = "mysql+sqlx";

/// MySQL executor.
pub(crate) struct MySqlExecutor {
    pool: MySqlPool,
}

/// Engine table constructor.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    Box::pin(async move {
        let pool = create_pool(url, config)?;
        Ok(Box::new(MySqlExecutor { pool }) as Box<dyn QueryExecutor>)
    })
}

fn create_pool(url: &str, config: &ConnectionConfig) -> Result<MySqlPool> {
    use sqlx::Executor;

    let max_execution_ms = config.query_timeout.as_millis();
    let read_only = config.read_only;

    MySqlPoolOptions::new()
        .max_connections(config.max_connections.min(100))
        .acquire_timeout(config.connect_timeout)
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET max_execution_time = {max_execution_ms}").as_str())
                    .await?;
                if read_only {
                    conn.execute("SET SESSION TRANSACTION READ ONLY").await?;
                }
                Ok(())
            })
        })
        .connect_lazy(url)
        .map_err(|e| {
            SourceGateError::connection_failed(
                format!("failed to create MySQL pool for {}", sanitize_url(url)),
                e,
            )
        })
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn backend(&self) -> Backend {
        Backend::MySql
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let mut stream = sqlx::raw_sql(sql).fetch(&self.pool);
        let mut result = QueryResult::default();

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| SourceGateError::query_failed("MySQL rejected the statement", e))?
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

fn decode_value(row: &MySqlRow, index: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return nullable(v, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return nullable(v, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return nullable(v, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return nullable(v, float);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
        return nullable(v, |n| float(f64::from(n)));
    }
    if let Ok(v) = row.try_get::<Option<sqlx::types::BigDecimal>, _>(index) {
        return nullable(v, |n| JsonValue::String(n.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return nullable(v, |t| JsonValue::String(t.to_rfc3339()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return nullable(v, |t| JsonValue::String(t.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return nullable(v, |d| JsonValue::String(d.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(index) {
        return nullable(v, |t| JsonValue::String(t.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<JsonValue>, _>(index) {
        return v.unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return nullable(v, |bytes| binary(&bytes));
    }

    JsonValue::Null
}
