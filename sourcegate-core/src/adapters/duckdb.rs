//! DuckDB backend, run on tokio's blocking pool.

use super::executor::{BlockingConnection, BlockingExecutor};
use super::values::{binary, float};
use super::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult};
use duckdb::types::Value;
use duckdb::{AccessMode, Config, Connection};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

const ENGINE: &str = "duckdb";
const MEMORY: &str = ":memory:";

/// Engine table constructor.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    let path = database_path(url);
    let read_only = config.read_only;

    Box::pin(async move {
        let connection = tokio::task::spawn_blocking(move || open(&path, read_only))
            .await
            .map_err(|e| SourceGateError::connection_failed("DuckDB open task failed", e))??;

        Ok(Box::new(BlockingExecutor::new(ENGINE, Backend::DuckDb, connection))
            as Box<dyn QueryExecutor>)
    })
}

fn database_path(url: &str) -> String {
    let rest = url
        .strip_prefix("duckdb://")
        .or_else(|| url.strip_prefix("duckdb:"))
        .unwrap_or(url);
    let rest = rest.split_once('?').map_or(rest, |(path, _)| path);
    if rest.is_empty() {
        MEMORY.to_string()
    } else {
        rest.to_string()
    }
}

fn open(path: &str, read_only: bool) -> Result<DuckDbConnection> {
    let connection = if path == MEMORY {
        Connection::open_in_memory()
    } else {
        let mode = if read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::Automatic
        };
        Config::default()
            .access_mode(mode)
            .and_then(|config| Connection::open_with_flags(path, config))
    }
    .map_err(|e| SourceGateError::connection_failed("failed to open DuckDB database", e))?;

    Ok(DuckDbConnection { connection })
}

/// One DuckDB connection.
pub(crate) struct DuckDbConnection {
    connection: Connection,
}

impl BlockingConnection for DuckDbConnection {
    fn query(&mut self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let mut statement = self
            .connection
            .prepare(sql)
            .map_err(|e| SourceGateError::query_failed("DuckDB rejected the statement", e))?;
        let mut rows = statement
            .query([])
            .map_err(|e| SourceGateError::query_failed("DuckDB query failed", e))?;

        // Column names are only known once the statement has run
        let columns = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();
        let width = columns.len();

        let mut result = QueryResult::new(columns, Vec::new());
        while let Some(row) = rows
            .next()
            .map_err(|e| SourceGateError::query_failed("failed to read DuckDB row", e))?
        {
            if result.rows.len() == max_rows {
                result.truncated = true;
                break;
            }
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                let value: Value = row
                    .get(index)
                    .map_err(|e| SourceGateError::query_failed("failed to read DuckDB value", e))?;
                values.push(decode_value(value));
            }
            result.rows.push(values);
        }

        Ok(result)
    }
}

fn decode_value(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(b),
        Value::TinyInt(n) => JsonValue::from(n),
        Value::SmallInt(n) => JsonValue::from(n),
        Value::Int(n) => JsonValue::from(n),
        Value::BigInt(n) => JsonValue::from(n),
        Value::UTinyInt(n) => JsonValue::from(n),
        Value::USmallInt(n) => JsonValue::from(n),
        Value::UInt(n) => JsonValue::from(n),
        Value::UBigInt(n) => JsonValue::from(n),
        Value::HugeInt(n) => JsonValue::String(n.to_string()),
        Value::Float(n) => float(f64::from(n)),
        Value::Double(n) => float(n),
        Value::Decimal(d) => JsonValue::String(d.to_string()),
        Value::Text(s) => JsonValue::String(s),
        Value::Blob(bytes) => binary(&bytes),
        other => JsonValue::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_database_path_forms() {
        assert_eq!(database_path("duckdb:///data/warehouse.duckdb"), "/data/warehouse.duckdb");
        assert_eq!(database_path("duckdb::memory:"), ":memory:");
    }

    #[test]
    fn test_query_collects_typed_rows() {
        let mut connection = open(MEMORY, true).unwrap();
        let result = connection
            .query("SELECT * FROM (VALUES (1, 'a'), (2, 'b'), (3, 'c')) AS t(id, name)", 2)
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows, vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]]);
        assert!(result.truncated);
    }
}
