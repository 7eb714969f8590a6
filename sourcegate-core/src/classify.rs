//! URL classification.
//!
//! Maps a connection URL onto a [`DatasourceKind`] using only its scheme and,
//! for `file` URLs, the target path on the local filesystem.

use crate::{
    Result, error::SourceGateError, models::DatasourceKind, security::sanitize_url,
};
use std::path::PathBuf;
use url::Url;

/// File extensions that mark a `file` URL as an API specification.
const SPEC_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Classifies a URL as a database, API or library source.
///
/// Rules, in order:
/// 1. `http`/`https` are APIs.
/// 2. `file` URLs must exist. Files ending in `.json`, `.yaml` or `.yml` are
///    API specifications; directories and any other file are libraries.
/// 3. Every other scheme is a database whose driver is the scheme.
///
/// Scheme and extension are compared case-insensitively.
///
/// # Errors
/// Returns `UnsupportedUrl` if the URL cannot be parsed or a `file` path
/// does not exist
pub fn classify(url: &str) -> Result<DatasourceKind> {
    let parsed = Url::parse(url).map_err(|e| {
        SourceGateError::unsupported_url(sanitize_url(url), format!("invalid URL: {e}"))
    })?;

    match parsed.scheme().to_ascii_lowercase().as_str() {
        "http" | "https" => Ok(DatasourceKind::Api),
        "file" => classify_path(&file_path(&parsed)?),
        _ => Ok(DatasourceKind::Database),
    }
}

/// Resolves a `file` URL to a local path.
///
/// # Errors
/// Returns `UnsupportedUrl` when the URL has no local path representation
pub fn file_path(url: &Url) -> Result<PathBuf> {
    url.to_file_path().map_err(|()| {
        SourceGateError::unsupported_url(
            sanitize_url(url.as_str()),
            "file URL does not name a local path",
        )
    })
}

fn classify_path(path: &std::path::Path) -> Result<DatasourceKind> {
    if path.is_dir() {
        return Ok(DatasourceKind::Library);
    }
    if !path.is_file() {
        return Err(SourceGateError::unsupported_url(
            format!("file://{}", path.display()),
            "path does not exist",
        ));
    }

    let is_spec = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .is_some_and(|ext| SPEC_EXTENSIONS.contains(&ext.as_str()));

    Ok(if is_spec {
        DatasourceKind::Api
    } else {
        DatasourceKind::Library
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_url(path: &std::path::Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn test_http_schemes_are_apis() {
        assert_eq!(classify("https://api.example.com/openapi.json").unwrap(), DatasourceKind::Api);
        assert_eq!(classify("HTTP://api.example.com").unwrap(), DatasourceKind::Api);
    }

    #[test]
    fn test_other_schemes_are_databases() {
        for url in [
            "postgresql://u:p@localhost:5432/db",
            "mysql://root@localhost/app",
            "sqlite:///tmp/app.db",
            "bigquery://project/dataset",
            "unknowndb://host",
        ] {
            assert_eq!(classify(url).unwrap(), DatasourceKind::Database, "{url}");
        }
    }

    #[test]
    fn test_spec_files_are_apis_regardless_of_case() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["openapi.json", "spec.yaml", "SPEC.YML", "Swagger.Json"] {
            let path = dir.path().join(name);
            std::fs::write(&path, "{}").unwrap();
            assert_eq!(classify(&file_url(&path)).unwrap(), DatasourceKind::Api, "{name}");
        }
    }

    #[test]
    fn test_directories_and_other_files_are_libraries() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(classify(&file_url(dir.path())).unwrap(), DatasourceKind::Library);

        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "hello").unwrap();
        assert_eq!(classify(&file_url(&notes)).unwrap(), DatasourceKind::Library);
    }

    #[test]
    fn test_missing_path_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = classify(&file_url(&missing)).unwrap_err();
        assert!(matches!(err, SourceGateError::UnsupportedUrl { .. }));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_garbage_is_unsupported() {
        assert!(matches!(
            classify("::not a url::"),
            Err(SourceGateError::UnsupportedUrl { .. })
        ));
    }
}
