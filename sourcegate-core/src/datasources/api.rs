//! OpenAPI-described HTTP services.
//!
//! The document is loaded once, from a local JSON/YAML file or over HTTP.
//! Query parameters on the spec URL are credentials: they are removed from
//! the URL before the document is fetched and re-applied to every request,
//! as headers or query parameters depending on the document's security
//! schemes.

use super::{ApiSource, DatasourceContext};
use crate::classify::file_path;
use crate::models::ApiResponse;
use crate::security::ConnectionUrl;
use crate::{Result, error::SourceGateError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use url::Url;
use zeroize::Zeroizing;

/// Methods that name an operation inside an OpenAPI path item.
pub const HTTP_METHODS: &[&str] = &["get", "post", "put", "delete", "patch", "head", "options"];

/// Parameter names sent as `Authorization: Bearer <value>`.
const BEARER_NAMES: &[&str] = &["bearer", "token", "access_token"];

/// Parameter names recognized as API keys and sent as query parameters.
const API_KEY_NAMES: &[&str] = &["apikey", "api_key", "key", "auth"];

/// Nesting limit when expanding local `$ref` pointers.
const MAX_REF_DEPTH: usize = 16;

/// Longest response body excerpt quoted in an error.
const ERROR_EXCERPT_CHARS: usize = 500;

/// One HTTP call against an API source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// HTTP method, any case
    pub method: String,
    /// Path relative to the API base URL, e.g. `/pets/1`
    pub path: String,
    /// JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
    /// Query parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Extra headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ApiRequest {
    /// Creates a request without body, parameters or headers.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Credentials applied to every request.
#[derive(Default)]
pub(crate) struct ApiAuth {
    params: Vec<(String, Zeroizing<String>)>,
    headers: Vec<(String, Zeroizing<String>)>,
}

impl std::fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |pairs: &[(String, Zeroizing<String>)]| {
            pairs.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>()
        };
        f.debug_struct("ApiAuth")
            .field("params", &names(&self.params))
            .field("headers", &names(&self.headers))
            .finish()
    }
}

/// A loaded API.
#[derive(Debug)]
pub struct ApiDatasource {
    url: String,
    spec: JsonValue,
    base_url: String,
    endpoints: Vec<String>,
    auth: ApiAuth,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl ApiDatasource {
    /// Loads the document behind `url` and prepares the HTTP client.
    ///
    /// # Errors
    /// Returns `Request` when the document cannot be fetched,
    /// `Serialization` when it is not JSON or YAML, and `Connection` when it
    /// has no paths or no usable server URL
    pub async fn connect(url: &ConnectionUrl, context: &DatasourceContext) -> Result<Self> {
        let sanitized = url.sanitized().to_string();
        let mut spec_url = url.parse()?;
        let credentials: Vec<(String, String)> = spec_url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        spec_url.set_query(None);

        let client = reqwest::Client::builder()
            .timeout(context.config.http_timeout)
            .connect_timeout(context.config.connection.connect_timeout)
            .user_agent(concat!("sourcegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceGateError::connection_failed("failed to build HTTP client", e))?;

        let spec = load_spec(&spec_url, &client)
            .await
            .map_err(|e| e.in_operation("load API spec", &sanitized))?;

        Self::from_spec(sanitized, spec, &spec_url, credentials, client, context.cancel.child_token())
    }

    /// Builds a source from an already parsed document.
    ///
    /// # Errors
    /// Returns `Connection` when the document has no paths or no usable
    /// server URL
    pub(crate) fn from_spec(
        sanitized_url: String,
        spec: JsonValue,
        spec_url: &Url,
        credentials: Vec<(String, String)>,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let endpoints = endpoint_names(&spec);
        if endpoints.is_empty() {
            return Err(SourceGateError::connection(format!(
                "no endpoints found in API spec at {sanitized_url}"
            )));
        }
        let base_url = base_url(&spec, spec_url)
            .map_err(|e| e.in_operation("load API spec", &sanitized_url))?;
        let auth = extract_auth(&spec, credentials);

        tracing::info!(
            url = %sanitized_url,
            base_url = %base_url,
            endpoints = endpoints.len(),
            "Loaded API spec"
        );

        Ok(Self {
            url: sanitized_url,
            spec,
            base_url,
            endpoints,
            auth,
            client,
            cancel,
        })
    }

    /// Credential-free URL of the spec.
    pub fn sanitized_url(&self) -> &str {
        &self.url
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cancels in-flight requests.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn build_request(&self, method: Method, call: &ApiRequest) -> Result<reqwest::RequestBuilder> {
        let path = if call.path.starts_with('/') {
            call.path.clone()
        } else {
            format!("/{}", call.path)
        };

        // Session credentials win over caller-supplied values of the same name
        let mut params: BTreeMap<&str, &str> = call
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        for (name, value) in &self.auth.params {
            params.insert(name, value.as_str());
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &call.headers {
            headers.insert(header_name(name)?, header_value(value, false)?);
        }
        for (name, value) in &self.auth.headers {
            headers.insert(header_name(name)?, header_value(value, true)?);
        }

        let mut request = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .query(&params)
            .headers(headers);
        if let Some(body) = &call.body {
            request = request.json(body);
        }
        Ok(request)
    }
}

#[async_trait]
impl ApiSource for ApiDatasource {
    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    fn inspect_endpoint(&self, method: &str, path: &str) -> Result<JsonValue> {
        let method = method.to_ascii_lowercase();
        self.spec
            .get("paths")
            .and_then(|paths| paths.get(path))
            .and_then(|item| item.get(&method))
            .filter(|operation| operation.as_object().is_some_and(|object| !object.is_empty()))
            .map(|operation| resolve_refs(operation, &self.spec, 0))
            .ok_or_else(|| {
                SourceGateError::not_found(format!(
                    "endpoint {} {path} in {}",
                    method.to_ascii_uppercase(),
                    self.url
                ))
            })
    }

    async fn request(&self, call: ApiRequest) -> Result<ApiResponse> {
        let operation = format!("request {} {}", call.method.to_ascii_uppercase(), call.path);
        let method = parse_method(&call.method).map_err(|e| e.in_operation(&operation, &self.url))?;
        let request = self
            .build_request(method, &call)
            .map_err(|e| e.in_operation(&operation, &self.url))?;

        tracing::debug!(url = %self.url, operation = %operation, "Sending API request");
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SourceGateError::cancelled(operation)),
            response = request.send() => response,
        }
        .map_err(|e| SourceGateError::request_failed("request was not completed", e.without_url()).in_operation(&operation, &self.url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SourceGateError::request_failed("response body unreadable", e.without_url()).in_operation(&operation, &self.url))?;

        if !status.is_success() {
            return Err(status_error(status, &text).in_operation(&operation, &self.url));
        }

        let body = if text.trim().is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        };
        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn status_error(status: StatusCode, body: &str) -> SourceGateError {
    let excerpt: String = body.chars().take(ERROR_EXCERPT_CHARS).collect();
    if excerpt.trim().is_empty() {
        SourceGateError::request(format!("server returned {status}"))
    } else {
        SourceGateError::request(format!("server returned {status}: {}", excerpt.trim()))
    }
}

fn parse_method(method: &str) -> Result<Method> {
    let lower = method.to_ascii_lowercase();
    if !HTTP_METHODS.contains(&lower.as_str()) {
        return Err(SourceGateError::configuration(format!(
            "unsupported HTTP method '{method}'"
        )));
    }
    Method::from_bytes(lower.to_ascii_uppercase().as_bytes())
        .map_err(|e| SourceGateError::configuration(format!("invalid HTTP method '{method}': {e}")))
}

fn header_name(name: &str) -> Result<HeaderName> {
    if name.eq_ignore_ascii_case(AUTHORIZATION.as_str()) {
        return Ok(AUTHORIZATION);
    }
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| SourceGateError::configuration(format!("invalid header name '{name}': {e}")))
}

fn header_value(value: &str, sensitive: bool) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| SourceGateError::configuration("header value contains invalid characters"))?;
    header.set_sensitive(sensitive);
    Ok(header)
}

/// Reads the document from a file or over HTTP.
async fn load_spec(spec_url: &Url, client: &reqwest::Client) -> Result<JsonValue> {
    match spec_url.scheme() {
        "file" => {
            let path = file_path(spec_url)?;
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| SourceGateError::io(format!("failed to read {}", path.display()), e))?;
            parse_spec(&text, is_yaml(&path))
        }
        "http" | "https" => {
            let response = client
                .get(spec_url.clone())
                .send()
                .await
                .map_err(|e| SourceGateError::request_failed("failed to fetch API spec", e.without_url()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| SourceGateError::request_failed("API spec body unreadable", e.without_url()))?;
            if !status.is_success() {
                return Err(status_error(status, &text));
            }
            let yaml = is_yaml(Path::new(spec_url.path()));
            parse_spec(&text, yaml)
        }
        other => Err(SourceGateError::unsupported_url(
            spec_url.as_str(),
            format!("API specs cannot be loaded over '{other}'"),
        )),
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

/// Parses JSON, or YAML when the name says so. JSON is tried first for
/// documents of unknown type since YAML would accept it too.
pub(crate) fn parse_spec(text: &str, yaml: bool) -> Result<JsonValue> {
    if yaml {
        return serde_yaml::from_str(text)
            .map_err(|e| SourceGateError::serialization("API spec is not valid YAML", e));
    }
    match serde_json::from_str(text) {
        Ok(spec) => Ok(spec),
        Err(json_error) => serde_yaml::from_str(text).map_err(|_| {
            SourceGateError::serialization("API spec is neither JSON nor YAML", json_error)
        }),
    }
}

/// Every operation as `"METHOD /path"`, in path order.
pub(crate) fn endpoint_names(spec: &JsonValue) -> Vec<String> {
    let Some(paths) = spec.get("paths").and_then(JsonValue::as_object) else {
        return Vec::new();
    };

    paths
        .iter()
        .flat_map(|(path, item)| {
            HTTP_METHODS
                .iter()
                .filter(move |method| item.get(**method).is_some())
                .map(move |method| format!("{} {path}", method.to_ascii_uppercase()))
        })
        .collect()
}

/// Resolves the URL requests are sent to.
///
/// OpenAPI 3 uses `servers[0].url` with its variables at their defaults;
/// a relative server URL is resolved against the spec URL when the spec was
/// fetched over HTTP. Swagger 2 uses `schemes[0]://host basePath`.
pub(crate) fn base_url(spec: &JsonValue, spec_url: &Url) -> Result<String> {
    if let Some(server) = spec.pointer("/servers/0") {
        let mut url = server
            .get("url")
            .and_then(JsonValue::as_str)
            .unwrap_or("/")
            .to_string();
        if let Some(variables) = server.get("variables").and_then(JsonValue::as_object) {
            for (name, variable) in variables {
                if let Some(default) = variable.get("default").and_then(JsonValue::as_str) {
                    url = url.replace(&format!("{{{name}}}"), default);
                }
            }
        }
        return absolute(&url, spec_url);
    }

    if let Some(host) = spec.get("host").and_then(JsonValue::as_str) {
        let scheme = spec
            .pointer("/schemes/0")
            .and_then(JsonValue::as_str)
            .unwrap_or("https");
        let base_path = spec.get("basePath").and_then(JsonValue::as_str).unwrap_or("");
        return Ok(format!("{scheme}://{host}{base_path}")
            .trim_end_matches('/')
            .to_string());
    }

    if spec.get("swagger").is_some() {
        return absolute(
            spec.get("basePath").and_then(JsonValue::as_str).unwrap_or("/"),
            spec_url,
        );
    }

    Err(SourceGateError::connection("API spec declares no server URL"))
}

fn absolute(server: &str, spec_url: &Url) -> Result<String> {
    if Url::parse(server).is_ok() {
        return Ok(server.trim_end_matches('/').to_string());
    }
    if matches!(spec_url.scheme(), "http" | "https") {
        let joined = spec_url
            .join(server)
            .map_err(|e| SourceGateError::configuration(format!("invalid server URL '{server}': {e}")))?;
        return Ok(joined.as_str().trim_end_matches('/').to_string());
    }
    Err(SourceGateError::connection(format!(
        "relative server URL '{server}' needs an HTTP spec location"
    )))
}

/// Sorts spec URL parameters into request credentials.
///
/// A parameter matching an `apiKey` security scheme's name goes where the
/// scheme says. Otherwise bearer-like names become an `Authorization`
/// header and everything else is sent as a query parameter.
pub(crate) fn extract_auth(spec: &JsonValue, credentials: Vec<(String, String)>) -> ApiAuth {
    let schemes: Vec<&JsonValue> = spec
        .pointer("/components/securitySchemes")
        .or_else(|| spec.get("securityDefinitions"))
        .and_then(JsonValue::as_object)
        .map(|schemes| schemes.values().collect())
        .unwrap_or_default();

    let mut auth = ApiAuth::default();
    for (name, value) in credentials {
        let value = Zeroizing::new(value);
        let scheme = schemes.iter().find(|scheme| {
            scheme.get("type").and_then(JsonValue::as_str) == Some("apiKey")
                && scheme
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .is_some_and(|scheme_name| scheme_name.eq_ignore_ascii_case(&name))
        });

        if let Some(scheme) = scheme {
            let scheme_name = scheme
                .get("name")
                .and_then(JsonValue::as_str)
                .unwrap_or(&name)
                .to_string();
            if scheme.get("in").and_then(JsonValue::as_str) == Some("header") {
                auth.headers.push((scheme_name, value));
            } else {
                auth.params.push((scheme_name, value));
            }
            continue;
        }

        let lower = name.to_ascii_lowercase();
        if BEARER_NAMES.contains(&lower.as_str()) {
            auth.headers.push((
                AUTHORIZATION.as_str().to_string(),
                Zeroizing::new(format!("Bearer {}", value.as_str())),
            ));
        } else {
            if !API_KEY_NAMES.contains(&lower.as_str()) {
                tracing::debug!(param = %name, "Forwarding spec URL parameter to every request");
            }
            auth.params.push((name, value));
        }
    }
    auth
}

/// Expands local `#/...` references so an operation is self-contained.
///
/// References nested deeper than [`MAX_REF_DEPTH`], and references that do
/// not resolve, are left as they are.
pub(crate) fn resolve_refs(value: &JsonValue, root: &JsonValue, depth: usize) -> JsonValue {
    match value {
        JsonValue::Object(object) => {
            if let Some(reference) = object.get("$ref").and_then(JsonValue::as_str)
                && depth < MAX_REF_DEPTH
                && let Some(target) = reference.strip_prefix('#').and_then(|pointer| root.pointer(pointer))
            {
                return resolve_refs(target, root, depth + 1);
            }
            JsonValue::Object(
                object
                    .iter()
                    .map(|(key, child)| (key.clone(), resolve_refs(child, root, depth)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| resolve_refs(item, root, depth)).collect())
        }
        other => other.clone(),
    }
}
