//! SQLite datasource integration tests.
//!
//! A real database file is created with sqlx, then reached only through a
//! `Session`, the way an embedding host would.

#![cfg(feature = "sqlite")]

use serde_json::json;
use sourcegate_core::{
    ConnectionConfig, DatasourceKind, Result, SearchMode, SearchRequest, Session, SessionConfig,
    SourceGateError,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;

/// Creates `shop.db` with two tables, a view and 150 orders.
async fn create_shop(dir: &Path) -> String {
    let path = dir.join("shop.db");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(&path).create_if_missing(true))
        .await
        .unwrap();

    sqlx::raw_sql(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT);
         CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL, total REAL);
         CREATE VIEW order_totals AS SELECT customer_id, SUM(total) AS total FROM orders GROUP BY customer_id;
         INSERT INTO customers (name, email) VALUES ('Ada', 'ada@example.com'), ('Grace', NULL);",
    )
    .execute(&pool)
    .await
    .unwrap();

    for i in 0..150 {
        sqlx::query("INSERT INTO orders (customer_id, total) VALUES (?, ?)")
            .bind(i % 2 + 1)
            .bind(f64::from(i) * 1.5)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;

    format!("sqlite://{}", path.display())
}

#[tokio::test]
async fn test_list_and_search_tables() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let url = create_shop(dir.path()).await;
    let session = Session::new(SessionConfig::default())?;

    let source = session.get_or_create(&url).await?;
    assert_eq!(source.kind(), DatasourceKind::Database);
    let database = source.as_database()?;

    assert_eq!(
        database.list_tables().await?,
        vec!["customers", "order_totals", "orders"]
    );

    let request = SearchRequest::new("orders", SearchMode::Bm25, 1);
    assert_eq!(database.search_tables(&request).await?, vec!["orders"]);

    let request = SearchRequest::new("^cust", SearchMode::Regex, 10);
    assert_eq!(database.search_tables(&request).await?, vec!["customers"]);

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn test_inspect_and_sample() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let url = create_shop(dir.path()).await;
    let session = Session::new(SessionConfig::default())?;
    let source = session.get_or_create(&url).await?;
    let database = source.as_database()?;

    let columns = database.inspect_table("customers").await?;
    assert_eq!(columns.columns[0], "column_name");
    let names: Vec<_> = columns.rows.iter().map(|row| row[0].clone()).collect();
    assert_eq!(names, vec![json!("id"), json!("name"), json!("email")]);

    let err = database.inspect_table("missing").await.unwrap_err();
    assert!(matches!(err, SourceGateError::NotFound { .. }));

    assert_eq!(database.sample_table("orders", None).await?.len(), 5);
    assert_eq!(database.sample_table("orders", Some(2)).await?.len(), 2);
    for n in [0, 101] {
        let err = database.sample_table("orders", Some(n)).await.unwrap_err();
        assert!(matches!(err, SourceGateError::Configuration { .. }), "n={n}");
    }

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn test_query_is_gated_and_truncated() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let url = create_shop(dir.path()).await;
    let session = Session::new(SessionConfig::default())?;
    let source = session.get_or_create(&url).await?;
    let database = source.as_database()?;

    let all = database.query("SELECT * FROM orders ORDER BY id").await?;
    assert_eq!(all.len(), 100);
    assert!(all.truncated);

    for sql in [
        "DELETE FROM orders",
        "SELECT 1; DROP TABLE orders",
        "WITH gone AS (DELETE FROM orders RETURNING *) SELECT * FROM gone",
    ] {
        let err = database.query(sql).await.unwrap_err();
        assert!(err.is_query_safety(), "{sql}");
    }

    let count = database.query("SELECT COUNT(*) AS n FROM orders").await?;
    assert_eq!(count.rows, vec![vec![json!(150)]]);
    assert!(!count.truncated);

    let err = database.query("SELECT * FROM nope").await.unwrap_err();
    assert!(matches!(err, SourceGateError::Query { .. }));
    assert!(err.to_string().contains("Failed to query database in sqlite://"));

    session.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_parameters_cannot_smuggle_a_write() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let url = create_shop(dir.path()).await;
    let config = SessionConfig::default()
        .with_connection(ConnectionConfig::default().with_read_only(false));
    let session = Session::new(config)?;
    let source = session.get_or_create(&url).await?;
    let database = source.as_database()?;

    for sql in [
        "SELECT $a$; DROP TABLE customers; $a$",
        "SELECT $a(') ; DROP TABLE customers; --'",
        "SELECT 1 /* /* */ '*/ ; DROP TABLE customers; --'",
    ] {
        let err = database.query(sql).await.unwrap_err();
        assert!(err.is_query_safety(), "{sql}");
    }

    assert_eq!(
        database.list_tables().await?,
        vec!["customers", "order_totals", "orders"]
    );
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_database_file_fails_to_connect() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("absent.db").display());
    let session = Session::new(SessionConfig::default())?;

    let err = session.get_or_create(&url).await.unwrap_err();
    assert!(matches!(err, SourceGateError::Connection { .. }));
    assert!(session.urls().is_empty());
    Ok(())
}
