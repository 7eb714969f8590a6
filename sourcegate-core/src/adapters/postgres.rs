//! PostgreSQL backend over a sqlx pool.

use super::values::{binary, float, nullable};
use super::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult, security::sanitize_url};
use async_trait::async_trait;
use futures::TryStreamExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row};

const ENGINE: &str = "postgresql+sqlx";

/// PostgreSQL executor.
pub(crate) struct PostgresExecutor {
    pool: PgPool,
}

/// Engine table constructor.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    Box::pin(async move {
        let pool = create_pool(url, config)?;
        Ok(Box::new(PostgresExecutor { pool }) as Box<dyn QueryExecutor>)
    })
}

/// Builds a lazy pool; the session's probe performs the first round trip.
///
/// Every pooled connection gets a statement timeout and, when configured,
/// read-only transactions.
fn create_pool(url: &str, config: &ConnectionConfig) -> Result<PgPool> {
    use sqlx::Executor;

    let statement_timeout_ms = config.query_timeout.as_millis();
    let read_only = config.read_only;

    PgPoolOptions::new()
        .max_connections(config.max_connections.min(100))
        .acquire_timeout(config.connect_timeout)
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {statement_timeout_ms}").as_str())
                    .await?;
                conn.execute("SET application_name = 'sourcegate'").await?;
                if read_only {
                    conn.execute("SET default_transaction_read_only = on").await?;
                }
                Ok(())
            })
        })
        .connect_lazy(url)
        .map_err(|e| {
            SourceGateError::connection_failed(
                format!("failed to create PostgreSQL pool for {}", sanitize_url(url)),
                e,
            )
        })
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let mut stream = sqlx::raw_sql(sql).fetch(&self.pool);
        let mut result = QueryResult::default();

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| SourceGateError::query_failed("PostgreSQL rejected the statement", e))?
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

/// Decodes one cell, trying the common PostgreSQL types in turn.
fn decode_value(row: &PgRow, index: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return nullable(v, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return nullable(v, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return nullable(v, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return nullable(v, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
        return nullable(v, |n| float(f64::from(n)));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return nullable(v, float);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return nullable(v, JsonValue::Bool);
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
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(index) {
        return nullable(v, |u| JsonValue::String(u.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<JsonValue>, _>(index) {
        return v.unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return nullable(v, |bytes| binary(&bytes));
    }

    JsonValue::Null
}
