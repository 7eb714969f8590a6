//! Cloud warehouses reached through their REST statement APIs.
//!
//! None of these backends has a plain TCP endpoint, so they are never
//! tunnelled. Each submodule turns a connection URL into request settings,
//! submits statements over HTTPS and polls until the statement finishes or
//! the query timeout runs out. Response parsing is kept in pure functions.

pub mod bigquery;
pub mod databricks;
pub mod snowflake;

use crate::config::ConnectionConfig;
use crate::{Result, error::SourceGateError};
use percent_encoding::percent_decode_str;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use super::values::float;

/// Delay between status polls of a running statement.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Builds the HTTP client shared by one warehouse connection.
pub(crate) fn http_client(config: &ConnectionConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.query_timeout + config.connect_timeout)
        .user_agent(concat!("sourcegate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SourceGateError::connection_failed("failed to build HTTP client", e))
}

/// Sends a request and returns the JSON body of a successful response.
///
/// Non-2xx responses become `Query` errors carrying the service's own
/// message when it sent one.
pub(crate) async fn send_json(request: reqwest::RequestBuilder, service: &str) -> Result<JsonValue> {
    let response = request
        .send()
        .await
        .map_err(|e| SourceGateError::request_failed(format!("{service} request failed"), e))?;
    read_json(response, service).await
}

/// Reads the JSON body of a response, failing on non-2xx statuses.
pub(crate) async fn read_json(response: reqwest::Response, service: &str) -> Result<JsonValue> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| SourceGateError::request_failed(format!("{service} response unreadable"), e))?;
    let body: JsonValue = if text.trim().is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_str(&text).map_err(|e| {
            SourceGateError::serialization(format!("{service} returned invalid JSON ({status})"), e)
        })?
    };

    if status.is_success() {
        Ok(body)
    } else {
        Err(SourceGateError::query(format!(
            "{service} returned {status}: {}",
            error_message(&body).unwrap_or("no error message")
        )))
    }
}

/// Finds a human-readable error message in a warehouse error body.
pub(crate) fn error_message(body: &JsonValue) -> Option<&str> {
    body.pointer("/error/message")
        .or_else(|| body.pointer("/status/error/message"))
        .or_else(|| body.get("message"))
        .and_then(JsonValue::as_str)
}

/// Repeats `check` every [`POLL_INTERVAL`] until it yields a value.
///
/// # Errors
/// Returns `Timeout` once `timeout` has elapsed, or the first error from
/// `check`
pub(crate) async fn poll_until<T, F, Fut>(operation: &str, timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return Err(SourceGateError::timeout(operation, timeout));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Case-insensitive query parameter lookup, ignoring empty values.
pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Percent-decodes a URL component such as a user name or path segment.
pub(crate) fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

/// Wire type of a column whose cells arrive as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellType {
    Integer,
    Float,
    Boolean,
    Text,
}

/// Converts a string-encoded cell to its JSON value.
///
/// Cells that fail to parse as their declared type stay strings. Nested
/// values (arrays, objects) pass through unchanged.
pub(crate) fn typed_cell(raw: &JsonValue, kind: CellType) -> JsonValue {
    let JsonValue::String(text) = raw else {
        return raw.clone();
    };

    match kind {
        CellType::Integer => text
            .parse::<i64>()
            .map_or_else(|_| raw.clone(), JsonValue::from),
        CellType::Float => text.parse::<f64>().map_or_else(|_| raw.clone(), float),
        CellType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            _ => raw.clone(),
        },
        CellType::Text => raw.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_cell_conversions() {
        assert_eq!(typed_cell(&json!("42"), CellType::Integer), json!(42));
        assert_eq!(typed_cell(&json!("1.5"), CellType::Float), json!(1.5));
        assert_eq!(typed_cell(&json!("TRUE"), CellType::Boolean), json!(true));
        assert_eq!(typed_cell(&json!("12.50"), CellType::Integer), json!("12.50"));
        assert_eq!(typed_cell(&JsonValue::Null, CellType::Integer), JsonValue::Null);
        assert_eq!(typed_cell(&json!("abc"), CellType::Text), json!("abc"));
    }

    #[test]
    fn test_error_message_locations() {
        assert_eq!(error_message(&json!({"error": {"message": "denied"}})), Some("denied"));
        assert_eq!(
            error_message(&json!({"status": {"error": {"message": "bad sql"}}})),
            Some("bad sql")
        );
        assert_eq!(error_message(&json!({"message": "nope"})), Some("nope"));
        assert_eq!(error_message(&json!({})), None);
    }

    #[test]
    fn test_query_param_is_case_insensitive() {
        let url = Url::parse("databricks://h?HTTP_PATH=/sql/1.0/warehouses/abc&token=").unwrap();
        assert_eq!(query_param(&url, "http_path").as_deref(), Some("/sql/1.0/warehouses/abc"));
        assert_eq!(query_param(&url, "token"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let err = poll_until::<(), _, _>("statement", Duration::from_secs(2), || async { Ok(None) })
            .await
            .unwrap_err();
        assert!(matches!(err, SourceGateError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_first_value() {
        let mut calls = 0;
        let value = poll_until("statement", Duration::from_secs(10), || {
            calls += 1;
            let done = calls == 3;
            async move { Ok(done.then_some(calls)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }
}
