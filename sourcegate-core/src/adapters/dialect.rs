//! Identifier quoting and metadata SQL per backend.
//!
//! User input only ever reaches SQL through [`quote_identifier`] and
//! [`quote_literal`]. Each metadata operation returns an ordered list of
//! statements for [`super::strategy::first_success`].

use super::Backend;
use crate::{Result, error::SourceGateError};

/// A table reference of one to three dot-separated parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePath {
    /// Catalog, database or project
    pub catalog: Option<String>,
    /// Schema or dataset
    pub schema: Option<String>,
    /// Table name
    pub table: String,
}

impl TablePath {
    /// Parses `table`, `schema.table` or `catalog.schema.table`.
    ///
    /// # Errors
    /// Returns a configuration error for empty parts or more than three parts
    pub fn parse(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.split('.').map(str::trim).collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(SourceGateError::configuration(format!(
                "invalid table path '{path}': empty identifier"
            )));
        }

        match parts.as_slice() {
            [table] => Ok(Self {
                catalog: None,
                schema: None,
                table: (*table).to_string(),
            }),
            [schema, table] => Ok(Self {
                catalog: None,
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            }),
            [catalog, schema, table] => Ok(Self {
                catalog: Some((*catalog).to_string()),
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            }),
            _ => Err(SourceGateError::configuration(format!(
                "invalid table path '{path}': expected 1 to 3 dot-separated parts"
            ))),
        }
    }

    fn parts(&self) -> impl Iterator<Item = &str> {
        self.catalog
            .iter()
            .chain(self.schema.iter())
            .map(String::as_str)
            .chain(std::iter::once(self.table.as_str()))
    }

    /// Quoted, dot-joined reference for `backend`.
    pub fn quoted(&self, backend: Backend) -> String {
        self.parts()
            .map(|part| quote_identifier(backend, part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl std::fmt::Display for TablePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.parts().collect::<Vec<_>>().join("."))
    }
}

/// Quotes one identifier, doubling embedded quote characters.
pub fn quote_identifier(backend: Backend, identifier: &str) -> String {
    match backend {
        Backend::MySql | Backend::BigQuery | Backend::Databricks => {
            format!("`{}`", identifier.replace('`', "``"))
        }
        Backend::SqlServer => format!("[{}]", identifier.replace(']', "]]")),
        Backend::Postgres | Backend::Sqlite | Backend::DuckDb | Backend::Snowflake => {
            format!("\"{}\"", identifier.replace('"', "\"\""))
        }
    }
}

/// Quotes a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Statements that list tables, most portable first.
///
/// Every statement returns one to three string columns that join into a
/// qualified table name.
pub fn list_tables(backend: Backend, scope: Option<&str>) -> Vec<String> {
    match backend {
        Backend::Postgres => vec![
            "SELECT table_schema::text, table_name::text FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name"
                .to_string(),
            "SELECT schemaname::text, tablename::text FROM pg_catalog.pg_tables \
             WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY schemaname, tablename"
                .to_string(),
        ],
        Backend::MySql => vec![
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_schema NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
             ORDER BY table_schema, table_name"
                .to_string(),
            "SHOW TABLES".to_string(),
        ],
        Backend::Sqlite => vec![
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') \
             AND name NOT LIKE 'sqlite_%' ORDER BY name"
                .to_string(),
        ],
        Backend::SqlServer => vec![
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             ORDER BY TABLE_SCHEMA, TABLE_NAME"
                .to_string(),
            "SELECT s.name AS table_schema, t.name AS table_name FROM sys.tables t JOIN sys.schemas s \
             ON t.schema_id = s.schema_id ORDER BY s.name, t.name"
                .to_string(),
        ],
        Backend::DuckDb => vec![
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_schema NOT IN ('information_schema', 'pg_catalog') \
             ORDER BY table_schema, table_name"
                .to_string(),
            "SHOW TABLES".to_string(),
        ],
        Backend::Snowflake => vec![
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_schema != 'INFORMATION_SCHEMA' ORDER BY table_schema, table_name"
                .to_string(),
            "SHOW TABLES".to_string(),
        ],
        Backend::Databricks => vec![
            "SHOW TABLES".to_string(),
            "SELECT table_schema, table_name FROM information_schema.tables \
             ORDER BY table_schema, table_name"
                .to_string(),
        ],
        Backend::BigQuery => scope
            .map(|scope| {
                vec![format!(
                    "SELECT table_schema, table_name FROM {}.INFORMATION_SCHEMA.TABLES \
                     ORDER BY table_schema, table_name",
                    quote_identifier(backend, scope)
                )]
            })
            .unwrap_or_default(),
    }
}

/// Statements that describe a table's columns, `information_schema` first.
pub fn inspect_table(backend: Backend, path: &TablePath, scope: Option<&str>) -> Vec<String> {
    let quoted = path.quoted(backend);
    let mut filters = vec![format!("table_name = {}", quote_literal(&path.table))];
    if let Some(schema) = &path.schema {
        filters.push(format!("table_schema = {}", quote_literal(schema)));
    }
    if let Some(catalog) = &path.catalog {
        filters.push(format!("table_catalog = {}", quote_literal(catalog)));
    }
    let filters = filters.join(" AND ");

    let information_schema = |columns: &str, source: &str| {
        format!("SELECT {columns} FROM {source} WHERE {filters} ORDER BY ordinal_position")
    };
    let standard = "column_name, data_type, is_nullable";

    match backend {
        Backend::Postgres => vec![
            information_schema(
                "column_name::text, data_type::text, is_nullable::text",
                "information_schema.columns",
            ),
            format!(
                "SELECT a.attname::text AS column_name, \
                 format_type(a.atttypid, a.atttypmod) AS data_type, \
                 NOT a.attnotnull AS is_nullable \
                 FROM pg_catalog.pg_attribute a \
                 WHERE a.attrelid = {}::regclass AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                quote_literal(&quoted)
            ),
        ],
        Backend::MySql => vec![
            information_schema(standard, "information_schema.columns"),
            format!("DESCRIBE {quoted}"),
        ],
        Backend::Sqlite => {
            let arguments = match &path.schema {
                Some(schema) => format!("{}, {}", quote_literal(&path.table), quote_literal(schema)),
                None => quote_literal(&path.table),
            };
            vec![format!(
                "SELECT name AS column_name, type AS data_type, NOT \"notnull\" AS is_nullable, \
                 pk AS primary_key FROM pragma_table_info({arguments}) ORDER BY cid"
            )]
        }
        Backend::SqlServer => vec![
            information_schema(standard, "INFORMATION_SCHEMA.COLUMNS"),
            format!(
                "SELECT c.name AS column_name, t.name AS data_type, c.is_nullable \
                 FROM sys.columns c JOIN sys.types t ON c.user_type_id = t.user_type_id \
                 WHERE c.object_id = OBJECT_ID({}) ORDER BY c.column_id",
                quote_literal(&quoted)
            ),
        ],
        Backend::DuckDb => vec![
            information_schema(standard, "information_schema.columns"),
            format!("DESCRIBE {quoted}"),
        ],
        Backend::Snowflake | Backend::Databricks => vec![
            information_schema(standard, "information_schema.columns"),
            format!("DESCRIBE TABLE {quoted}"),
        ],
        Backend::BigQuery => {
            let dataset = match (&path.catalog, &path.schema) {
                (Some(catalog), Some(schema)) => Some(format!("{catalog}.{schema}")),
                (None, Some(schema)) => Some(schema.clone()),
                _ => scope.map(str::to_string),
            };
            dataset
                .map(|dataset| {
                    vec![format!(
                        "SELECT column_name, data_type, is_nullable FROM {}.INFORMATION_SCHEMA.COLUMNS \
                         WHERE table_name = {} ORDER BY ordinal_position",
                        quote_identifier(backend, &dataset),
                        quote_literal(&path.table)
                    )]
                })
                .unwrap_or_default()
        }
    }
}

/// Statements that fetch `n` rows, plain limit first, sampling second.
pub fn sample_table(backend: Backend, path: &TablePath, n: usize) -> Vec<String> {
    let quoted = path.quoted(backend);
    match backend {
        Backend::Postgres => vec![
            format!("SELECT * FROM {quoted} LIMIT {n}"),
            format!("SELECT * FROM {quoted} TABLESAMPLE BERNOULLI (50) LIMIT {n}"),
        ],
        Backend::MySql | Backend::Sqlite => vec![format!("SELECT * FROM {quoted} LIMIT {n}")],
        Backend::SqlServer => vec![
            format!("SELECT TOP {n} * FROM {quoted}"),
            format!("SELECT TOP {n} * FROM {quoted} TABLESAMPLE (50 PERCENT)"),
        ],
        Backend::DuckDb => vec![
            format!("SELECT * FROM {quoted} LIMIT {n}"),
            format!("SELECT * FROM {quoted} USING SAMPLE {n} ROWS"),
        ],
        Backend::Snowflake => vec![
            format!("SELECT * FROM {quoted} LIMIT {n}"),
            format!("SELECT * FROM {quoted} SAMPLE ({n} ROWS)"),
        ],
        Backend::Databricks => vec![
            format!("SELECT * FROM {quoted} LIMIT {n}"),
            format!("SELECT * FROM {quoted} TABLESAMPLE ({n} ROWS)"),
        ],
        Backend::BigQuery => vec![
            format!("SELECT * FROM {quoted} LIMIT {n}"),
            format!("SELECT * FROM {quoted} TABLESAMPLE SYSTEM (10 PERCENT) LIMIT {n}"),
        ],
    }
}

/// Harmless round trip used as a connectivity probe.
pub const fn probe(_backend: Backend) -> &'static str {
    "SELECT 1"
}
