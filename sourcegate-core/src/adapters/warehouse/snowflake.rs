//! Snowflake over the SQL API (`/api/v2/statements`).
//!
//! URL form: `snowflake://<user>:<token>@<account>/<database>/<schema>?warehouse=<wh>&role=<role>`.
//! The password is sent as a programmatic access token. A `token` parameter
//! takes precedence and is sent as an OAuth token.

use super::{
    CellType, decode, http_client, poll_until, query_param, read_json, send_json, typed_cell,
};
use crate::adapters::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult, security::sanitize_url};
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

const ENGINE: &str = "snowflake+rest";
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

/// Connection settings parsed from a `snowflake://` URL.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub(crate) struct SnowflakeSettings {
    base_url: String,
    database: Option<String>,
    schema: Option<String>,
    warehouse: Option<String>,
    role: Option<String>,
    token: Zeroizing<String>,
    token_type: &'static str,
}

impl SnowflakeSettings {
    pub(crate) fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            SourceGateError::unsupported_url(sanitize_url(url), format!("invalid Snowflake URL: {e}"))
        })?;

        let account = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| SourceGateError::configuration("Snowflake URL needs an account identifier"))?;
        let base_url = query_param(&parsed, "endpoint").map_or_else(
            || {
                if account.contains('.') {
                    format!("https://{account}")
                } else {
                    format!("https://{account}.snowflakecomputing.com")
                }
            },
            |endpoint| endpoint.trim_end_matches('/').to_string(),
        );

        let mut path = parsed
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|segment| !segment.is_empty())
            .map(decode);
        let database = path.next();
        let schema = path.next();

        let (token, token_type) = match query_param(&parsed, "token") {
            Some(token) => (token, "OAUTH"),
            None => (
                parsed
                    .password()
                    .map(decode)
                    .filter(|password| !password.is_empty())
                    .ok_or_else(|| {
                        SourceGateError::configuration("Snowflake URL needs a token parameter or password")
                    })?,
                "PROGRAMMATIC_ACCESS_TOKEN",
            ),
        };

        Ok(Self {
            base_url,
            database,
            schema,
            warehouse: query_param(&parsed, "warehouse"),
            role: query_param(&parsed, "role"),
            token: Zeroizing::new(token),
            token_type,
        })
    }

    fn statements_url(&self) -> String {
        format!("{}/api/v2/statements", self.base_url)
    }
}

/// Snowflake executor.
pub(crate) struct SnowflakeExecutor {
    client: reqwest::Client,
    settings: SnowflakeSettings,
    query_timeout: Duration,
}

/// Engine table constructor.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    Box::pin(async move {
        let settings = SnowflakeSettings::from_url(url)?;
        tracing::debug!(endpoint = %settings.base_url, "Prepared Snowflake connection");
        Ok(Box::new(SnowflakeExecutor {
            client: http_client(config)?,
            settings,
            query_timeout: config.query_timeout,
        }) as Box<dyn QueryExecutor>)
    })
}

/// Builds the statement submission body.
pub(crate) fn statement_body(settings: &SnowflakeSettings, sql: &str, query_timeout: Duration) -> JsonValue {
    let mut body = json!({
        "statement": sql,
        "timeout": query_timeout.as_secs().max(1),
    });
    let optional = [
        ("database", &settings.database),
        ("schema", &settings.schema),
        ("warehouse", &settings.warehouse),
        ("role", &settings.role),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            body[key] = json!(value);
        }
    }
    body
}

/// Converts a finished statement response into a result.
///
/// Only the first partition is read; it holds far more rows than the row
/// cap allows.
pub(crate) fn parse_result(body: &JsonValue, max_rows: usize) -> QueryResult {
    let row_type = body
        .pointer("/resultSetMetaData/rowType")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let columns = row_type
        .iter()
        .map(|column| column.get("name").and_then(JsonValue::as_str).unwrap_or_default().to_string())
        .collect();
    let types: Vec<CellType> = row_type.iter().map(cell_type).collect();

    let rows = body
        .get("data")
        .and_then(JsonValue::as_array)
        .map(|rows| {
            rows.iter()
                .take(max_rows + 1)
                .filter_map(JsonValue::as_array)
                .map(|cells| cells.iter().zip(&types).map(|(cell, kind)| typed_cell(cell, *kind)).collect())
                .collect()
        })
        .unwrap_or_default();

    QueryResult::new(columns, rows).truncate(max_rows)
}

/// `fixed` columns with a scale are decimals and stay strings.
fn cell_type(column: &JsonValue) -> CellType {
    let kind = column.get("type").and_then(JsonValue::as_str).unwrap_or_default();
    let scale = column.get("scale").and_then(JsonValue::as_i64).unwrap_or(0);
    match kind {
        "fixed" if scale == 0 => CellType::Integer,
        "real" => CellType::Float,
        "boolean" => CellType::Boolean,
        _ => CellType::Text,
    }
}

impl SnowflakeExecutor {
    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(self.settings.token.as_str())
            .header(TOKEN_TYPE_HEADER, self.settings.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Reads a statement's status; `None` while it is still running.
    async fn status(&self, url: &str, max_rows: usize) -> Result<Option<QueryResult>> {
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| SourceGateError::request_failed("Snowflake status request failed", e))?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(None);
        }
        let body = read_json(response, "Snowflake").await?;
        Ok(Some(parse_result(&body, max_rows)))
    }
}

#[async_trait]
impl QueryExecutor for SnowflakeExecutor {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn backend(&self) -> Backend {
        Backend::Snowflake
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let body = statement_body(&self.settings, sql, self.query_timeout);
        let first = send_json(
            self.authorized(self.client.post(self.settings.statements_url()))
                .json(&body),
            "Snowflake",
        )
        .await?;

        // Synchronous completion carries result metadata; otherwise poll the handle
        if first.get("resultSetMetaData").is_some() {
            return Ok(parse_result(&first, max_rows));
        }

        let handle = first
            .get("statementHandle")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SourceGateError::query("Snowflake response has no statement handle"))?;
        let status_url = format!("{}/{handle}", self.settings.statements_url());

        poll_until("Snowflake statement", self.query_timeout, || self.status(&status_url, max_rows)).await
    }
}
