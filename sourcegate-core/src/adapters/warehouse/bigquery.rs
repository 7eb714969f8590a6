//! BigQuery over the `jobs.query` REST API.
//!
//! URL form: `bigquery://<project>/<dataset>?access_token=<token>`. Without
//! an `access_token` parameter the token is read from
//! `GOOGLE_OAUTH_ACCESS_TOKEN`. An `endpoint` parameter overrides the API
//! base URL.

use super::{CellType, decode, http_client, poll_until, query_param, send_json, typed_cell};
use crate::adapters::{Backend, QueryExecutor};
use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError, models::QueryResult, security::sanitize_url};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value as JsonValue, json};
use url::Url;
use zeroize::Zeroizing;

const ENGINE: &str = "bigquery+rest";
const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
const TOKEN_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Connection settings parsed from a `bigquery://` URL.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub(crate) struct BigQuerySettings {
    project: String,
    dataset: Option<String>,
    endpoint: String,
    token: Zeroizing<String>,
    scope: String,
}

impl BigQuerySettings {
    pub(crate) fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            SourceGateError::unsupported_url(sanitize_url(url), format!("invalid BigQuery URL: {e}"))
        })?;

        let project = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .map(decode)
            .ok_or_else(|| SourceGateError::configuration("BigQuery URL needs a project: bigquery://<project>/<dataset>"))?;
        let dataset = parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|segment| !segment.is_empty())
            .map(decode);

        let token = query_param(&parsed, "access_token")
            .or_else(|| std::env::var(TOKEN_VAR).ok().filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                SourceGateError::configuration(format!(
                    "BigQuery needs an access_token URL parameter or {TOKEN_VAR}"
                ))
            })?;
        let endpoint = query_param(&parsed, "endpoint")
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        let scope = dataset
            .as_ref()
            .map_or_else(|| project.clone(), |dataset| format!("{project}.{dataset}"));

        Ok(Self {
            project,
            dataset,
            endpoint,
            token: Zeroizing::new(token),
            scope,
        })
    }

    fn queries_url(&self) -> String {
        format!("{}/projects/{}/queries", self.endpoint, self.project)
    }
}

/// BigQuery executor.
pub(crate) struct BigQueryExecutor {
    client: reqwest::Client,
    settings: BigQuerySettings,
    query_timeout: std::time::Duration,
}

/// Engine table constructor.
pub(crate) fn connect<'a>(
    url: &'a str,
    config: &'a ConnectionConfig,
) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
    Box::pin(async move {
        let settings = BigQuerySettings::from_url(url)?;
        tracing::debug!(project = %settings.project, "Prepared BigQuery connection");
        Ok(Box::new(BigQueryExecutor {
            client: http_client(config)?,
            settings,
            query_timeout: config.query_timeout,
        }) as Box<dyn QueryExecutor>)
    })
}

/// Builds the `jobs.query` request body.
pub(crate) fn query_body(settings: &BigQuerySettings, sql: &str, max_rows: usize, timeout_ms: u64) -> JsonValue {
    let mut body = json!({
        "query": sql,
        "useLegacySql": false,
        "maxResults": max_rows + 1,
        "timeoutMs": timeout_ms,
    });
    if let Some(dataset) = &settings.dataset {
        body["defaultDataset"] = json!({
            "projectId": settings.project,
            "datasetId": dataset,
        });
    }
    body
}

/// Converts a completed query response into a result.
///
/// Returns `None` while the job is still running.
pub(crate) fn parse_response(body: &JsonValue, max_rows: usize) -> Option<QueryResult> {
    if !body.get("jobComplete").and_then(JsonValue::as_bool).unwrap_or(false) {
        return None;
    }

    let fields = body
        .pointer("/schema/fields")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let columns = fields
        .iter()
        .map(|field| field.get("name").and_then(JsonValue::as_str).unwrap_or_default().to_string())
        .collect();
    let types: Vec<CellType> = fields
        .iter()
        .map(|field| {
            let repeated = field.get("mode").and_then(JsonValue::as_str) == Some("REPEATED");
            let kind = field.get("type").and_then(JsonValue::as_str).unwrap_or_default();
            if repeated {
                CellType::Text
            } else {
                cell_type(kind)
            }
        })
        .collect();

    let rows = body
        .get("rows")
        .and_then(JsonValue::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.get("f")
                        .and_then(JsonValue::as_array)
                        .map(|cells| {
                            cells
                                .iter()
                                .zip(&types)
                                .map(|(cell, kind)| cell.get("v").map_or(JsonValue::Null, |v| typed_cell(v, *kind)))
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    Some(QueryResult::new(columns, rows).truncate(max_rows))
}

fn cell_type(kind: &str) -> CellType {
    match kind {
        "INTEGER" | "INT64" => CellType::Integer,
        "FLOAT" | "FLOAT64" => CellType::Float,
        "BOOLEAN" | "BOOL" => CellType::Boolean,
        _ => CellType::Text,
    }
}

#[async_trait]
impl QueryExecutor for BigQueryExecutor {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn backend(&self) -> Backend {
        Backend::BigQuery
    }

    fn catalog_scope(&self) -> Option<&str> {
        Some(&self.settings.scope)
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryResult> {
        let timeout_ms = u64::try_from(self.query_timeout.as_millis()).unwrap_or(u64::MAX);
        let body = query_body(&self.settings, sql, max_rows, timeout_ms);
        let first = send_json(
            self.client
                .post(self.settings.queries_url())
                .bearer_auth(self.settings.token.as_str())
                .json(&body),
            "BigQuery",
        )
        .await?;

        if let Some(result) = parse_response(&first, max_rows) {
            return Ok(result);
        }

        let job_id = first
            .pointer("/jobReference/jobId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SourceGateError::query("BigQuery response has no job reference"))?
            .to_string();
        let location = first
            .pointer("/jobReference/location")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let results_url = format!("{}/{job_id}", self.settings.queries_url());

        poll_until("BigQuery query", self.query_timeout, || {
            let mut request = self
                .client
                .get(&results_url)
                .bearer_auth(self.settings.token.as_str())
                .query(&[("maxResults", (max_rows + 1).to_string())]);
            if let Some(location) = &location {
                request = request.query(&[("location", location)]);
            }
            async move {
                let body = send_json(request, "BigQuery").await?;
                Ok(parse_response(&body, max_rows))
            }
        })
        .await
    }
}
