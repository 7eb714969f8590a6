//! SQLite backend over rusqlite, run on tokio's blocking pool.

use super::executor::{BlockingConnection, BlockingExecutor};
use super::values::{binary, float, text_or_binary};
use super::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult};
use futures::future::BoxFuture;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value as JsonValue;

const ENGINE: &str = "sqlite+rusqlite";
const MEMORY: &str = ":memory:";

/// Engine table constructor.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    let path = database_path(url);
    let read_only = config.read_only;
    let busy_timeout = config.query_timeout;

    Box::pin(async move {
        let connection = tokio::task::spawn_blocking(move || open(&path, read_only, busy_timeout))
            .await
            .map_err(|e| SourceGateError::connection_failed("SQLite open task failed", e))??;

        Ok(Box::new(BlockingExecutor::new(ENGINE, Backend::Sqlite, connection))
            as Box<dyn QueryExecutor>)
    })
}

/// Maps `sqlite:///abs.db`, `sqlite://rel.db` and `sqlite::memory:` to a path.
fn database_path(url: &str) -> String {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let rest = rest.split_once('?').map_or(rest, |(path, _)| path);
    if rest.is_empty() {
        MEMORY.to_string()
    } else {
        rest.to_string()
    }
}

fn open(path: &str, read_only: bool, busy_timeout: std::time::Duration) -> Result<SqliteConnection> {
    let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
    if read_only && path != MEMORY {
        flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
    } else {
        flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
        if path == MEMORY {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
    }

    let connection = Connection::open_with_flags(path, flags)
        .map_err(|e| SourceGateError::connection_failed("failed to open SQLite database", e))?;
    connection
        .busy_timeout(busy_timeout)
        .map_err(|e| SourceGateError::connection_failed("failed to set SQLite busy timeout", e))?;

    Ok(SqliteConnection { connection })
}

/// One rusqlite connection.
pub(crate) struct SqliteConnection {
    connection: Connection,
}

impl BlockingConnection for SqliteConnection {
    fn query(&mut self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let mut statement = self
            .connection
            .prepare(sql)
            .map_err(|e| SourceGateError::query_failed("SQLite rejected the statement", e))?;

        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();

        let mut rows = statement
            .query([])
            .map_err(|e| SourceGateError::query_failed("SQLite query failed", e))?;

        let mut result = QueryResult::new(columns, Vec::new());
        while let Some(row) = rows
            .next()
            .map_err(|e| SourceGateError::query_failed("failed to read SQLite row", e))?
        {
            if result.rows.len() == max_rows {
                result.truncated = true;
                break;
            }
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                let value = row
                    .get_ref(index)
                    .map_err(|e| SourceGateError::query_failed("failed to read SQLite value", e))?;
                values.push(decode_value(value));
            }
            result.rows.push(values);
        }

        Ok(result)
    }
}

fn decode_value(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(n) => JsonValue::from(n),
        ValueRef::Real(n) => float(n),
        ValueRef::Text(bytes) => text_or_binary(bytes),
        ValueRef::Blob(bytes) => binary(bytes),
    }
}
