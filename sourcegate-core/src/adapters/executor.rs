//! Query execution seam shared by every backend.
//!
//! Async drivers implement [`QueryExecutor`] directly. Drivers that only
//! offer a blocking API implement [`BlockingConnection`] and are wrapped in
//! a [`BlockingExecutor`], which moves each call onto tokio's blocking pool.

use super::Backend;
use crate::{Result, error::SourceGateError, models::QueryResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Runs SQL against one live backend.
///
/// Implementations return at most `max_rows` rows and set
/// [`QueryResult::truncated`] when more were available.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Engine string from the engine table, e.g. `postgresql+sqlx`.
    fn engine(&self) -> &'static str;

    /// Backend family, used to pick SQL dialect.
    fn backend(&self) -> Backend;

    /// Catalog scope that unqualified metadata queries need, if any.
    ///
    /// BigQuery returns `project.dataset`; everything else `None`.
    fn catalog_scope(&self) -> Option<&str> {
        None
    }

    /// Executes `sql` and collects up to `max_rows` rows.
    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult>;

    /// Releases pooled connections. Later calls fail.
    async fn close(&self) {}
}

/// Synchronous connection used through [`BlockingExecutor`].
pub trait BlockingConnection: Send + 'static {
    /// Executes `sql` and collects up to `max_rows` rows.
    ///
    /// # Errors
    /// Returns a `Query` error when the driver rejects the statement
    fn query(&mut self, sql: &str, max_rows: usize) -> Result<QueryResult>;
}

/// Adapts a [`BlockingConnection`] to [`QueryExecutor`].
pub struct BlockingExecutor<C: BlockingConnection> {
    engine: &'static str,
    backend: Backend,
    connection: Arc<Mutex<Option<C>>>,
}

impl<C: BlockingConnection> BlockingExecutor<C> {
    /// Wraps an open connection.
    pub fn new(engine: &'static str, backend: Backend, connection: C) -> Self {
        Self {
            engine,
            backend,
            connection: Arc::new(Mutex::new(Some(connection))),
        }
    }
}

#[async_trait]
impl<C: BlockingConnection> QueryExecutor for BlockingExecutor<C> {
    fn engine(&self) -> &'static str {
        self.engine
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let connection = Arc::clone(&self.connection);
        let sql = sql.to_string();
        let engine = self.engine;

        tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock();
            let connection = guard
                .as_mut()
                .ok_or_else(|| SourceGateError::query(format!("{engine} connection is closed")))?;
            connection.query(&sql, max_rows)
        })
        .await
        .map_err(|e| SourceGateError::query_failed(format!("{engine} worker failed"), e))?
    }

    async fn close(&self) {
        let connection = Arc::clone(&self.connection);
        // Dropping the driver handle may block on file locks.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(connection.lock().take())).await {
            tracing::warn!("Failed to close {} connection: {}", self.engine, e);
        }
    }
}
