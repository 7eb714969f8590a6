//! Document libraries rooted at a local directory.
//!
//! Decoding a document into text is delegated to a [`DocumentReader`]. The
//! built-in [`TextReader`] handles UTF-8 text formats; binary formats need
//! a reader supplied by the caller.

use super::{DatasourceContext, LibrarySource};
use crate::classify::file_path;
use crate::config::SessionConfig;
use crate::models::Page;
use crate::pagination::{select_page, split_units};
use crate::security::ConnectionUrl;
use crate::{Result, error::SourceGateError};
use async_trait::async_trait;
use globset::GlobBuilder;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Turns a document file into text.
pub trait DocumentReader: Send + Sync + 'static {
    /// Whether files with this lower-cased extension can be read.
    fn supports(&self, extension: &str) -> bool;

    /// Reads the whole document as text.
    ///
    /// # Errors
    /// Returns a `Document` error when the file cannot be decoded
    fn read(&self, path: &Path) -> Result<String>;
}

/// Reader for UTF-8 text formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextReader;

impl TextReader {
    /// Extensions read as plain text.
    pub const EXTENSIONS: &'static [&'static str] = &[
        "txt", "md", "markdown", "rst", "csv", "tsv", "json", "jsonl", "yaml", "yml", "toml",
        "xml", "html", "htm", "log", "ini", "cfg", "conf", "sql", "tex",
    ];
}

impl DocumentReader for TextReader {
    fn supports(&self, extension: &str) -> bool {
        Self::EXTENSIONS.contains(&extension)
    }

    fn read(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)
            .map_err(|e| SourceGateError::io(format!("failed to read {}", path.display()), e))?;
        String::from_utf8(bytes).map_err(|e| {
            SourceGateError::document_failed(format!("{} is not valid UTF-8", path.display()), e)
        })
    }
}

/// A directory of documents.
pub struct LibraryDatasource {
    url: String,
    root: PathBuf,
    config: Arc<SessionConfig>,
    reader: Arc<dyn DocumentReader>,
}

impl std::fmt::Debug for LibraryDatasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryDatasource")
            .field("url", &self.url)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LibraryDatasource {
    /// Opens the directory (or the parent of the file) named by a `file://` URL.
    ///
    /// # Errors
    /// Returns `UnsupportedUrl` for non-file URLs and `Io` when the path
    /// cannot be resolved
    pub fn open(url: &ConnectionUrl, context: &DatasourceContext) -> Result<Self> {
        Self::with_reader(url, Arc::clone(&context.config), Arc::new(TextReader))
    }

    /// Opens a library that decodes documents with `reader`.
    ///
    /// # Errors
    /// Same as [`LibraryDatasource::open`]
    pub fn with_reader(
        url: &ConnectionUrl,
        config: Arc<SessionConfig>,
        reader: Arc<dyn DocumentReader>,
    ) -> Result<Self> {
        let parsed = url.parse()?;
        if parsed.scheme() != "file" {
            return Err(SourceGateError::unsupported_url(
                url.sanitized(),
                "libraries must be file:// URLs",
            ));
        }

        let path = file_path(&parsed)?;
        let root = if path.is_file() {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            path
        };
        let root = root
            .canonicalize()
            .map_err(|e| SourceGateError::io(format!("failed to resolve library root {}", root.display()), e))?;

        tracing::debug!(url = %url.sanitized(), root = %root.display(), "Opened library");
        Ok(Self {
            url: url.sanitized().to_string(),
            root,
            config,
            reader,
        })
    }

    /// Credential-free URL of the library.
    pub fn sanitized_url(&self) -> &str {
        &self.url
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks that the root is still a readable directory.
    ///
    /// # Errors
    /// Returns `Connection` when it is not
    pub fn probe(&self) -> Result<()> {
        std::fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|e| {
                SourceGateError::connection_failed("library root is not readable", e)
                    .in_operation("open library", &self.url)
            })
    }

    /// Resolves a caller-supplied relative path to a file inside the root.
    fn resolve(&self, document: &str) -> Result<PathBuf> {
        let relative = Path::new(document);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(SourceGateError::document(format!(
                "'{document}' is outside the library root"
            )));
        }

        let candidate = self.root.join(relative);
        let resolved = candidate
            .canonicalize()
            .map_err(|_| SourceGateError::not_found(format!("document '{document}' in {}", self.url)))?;
        // Symlinks may still point elsewhere
        if !resolved.starts_with(&self.root) {
            return Err(SourceGateError::document(format!(
                "'{document}' is outside the library root"
            )));
        }
        if !resolved.is_file() {
            return Err(SourceGateError::not_found(format!("document '{document}' in {}", self.url)));
        }
        Ok(resolved)
    }

    async fn walk(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let reader = Arc::clone(&self.reader);
        let limit = self.config.library_walk_limit;

        tokio::task::spawn_blocking(move || list_documents(&root, reader.as_ref(), limit))
            .await
            .map_err(|e| SourceGateError::document_failed("library walk task failed", e))?
    }
}

/// Relative, `/`-separated paths of every supported document.
///
/// Fails once more than `limit` documents are found rather than returning a
/// listing that search and glob would silently miss files from.
fn list_documents(root: &Path, reader: &dyn DocumentReader, limit: usize) -> Result<Vec<String>> {
    let documents: Vec<String> = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Skipping unreadable library entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| extension(entry.path()).is_some_and(|ext| reader.supports(&ext)))
        .filter_map(|entry| relative_name(root, entry.path()))
        .take(limit.saturating_add(1))
        .collect();

    if documents.len() > limit {
        return Err(SourceGateError::document(format!(
            "library holds more than {limit} documents; raise library_walk_limit or open a subdirectory"
        )));
    }
    Ok(documents)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

#[async_trait]
impl LibrarySource for LibraryDatasource {
    async fn documents(&self) -> Result<Vec<String>> {
        self.walk()
            .await
            .map_err(|e| e.in_operation("list documents", &self.url))
    }

    async fn glob_documents(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SourceGateError::search_mode(format!("invalid glob '{pattern}': {e}")))?
            .compile_matcher();

        let documents = self.documents().await?;
        Ok(documents
            .into_iter()
            .filter(|document| matcher.is_match(document))
            .collect())
    }

    async fn read_document(&self, path: &str, pagination: Option<f64>) -> Result<Page> {
        let operation = format!("read document '{path}'");
        let resolved = self.resolve(path).map_err(|e| e.in_operation(&operation, &self.url))?;

        let ext = extension(&resolved).unwrap_or_default();
        if !self.reader.supports(&ext) {
            let shown = if ext.is_empty() { "(none)".to_string() } else { format!(".{ext}") };
            return Err(SourceGateError::document(format!(
                "unsupported document type {shown}; no reader is configured for it"
            ))
            .in_operation(&operation, &self.url));
        }

        let reader = Arc::clone(&self.reader);
        let text = tokio::task::spawn_blocking(move || reader.read(&resolved))
            .await
            .map_err(|e| SourceGateError::document_failed("document reader task failed", e))
            .and_then(|read| read)
            .map_err(|e| e.in_operation(&operation, &self.url))?;

        let units = split_units(&text, self.config.document_chunk_chars);
        // Every p resolves into range on a non-empty unit list, so only an
        // empty document lands here; it reads as a page with zero units.
        let page = select_page(&units, pagination.unwrap_or(0.0)).unwrap_or(Page {
            content: String::new(),
            unit_index: 0,
            total_units: 0,
        });
        tracing::debug!(url = %self.url, document = path, unit = page.unit_index, total = page.total_units, "Read document");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(dir: &Path, chunk: usize) -> LibraryDatasource {
        let url = ConnectionUrl::new(url::Url::from_directory_path(dir).unwrap().to_string());
        let config = SessionConfig::default().with_document_chunk_chars(chunk);
        LibraryDatasource::with_reader(&url, Arc::new(config), Arc::new(TextReader)).unwrap()
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("guides/setup")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("README.md"), "# Library\n").unwrap();
        std::fs::write(dir.path().join("guides/setup/install.txt"), "step one\nstep two\n").unwrap();
        std::fs::write(dir.path().join("guides/report.pdf"), b"%PDF-1.7").unwrap();
        std::fs::write(dir.path().join(".git/config"), "[core]\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_documents_are_relative_and_supported_only() {
        let dir = fixture();
        let documents = library(dir.path(), 100).documents().await.unwrap();
        assert_eq!(documents, vec!["README.md", "guides/setup/install.txt"]);
    }

    #[tokio::test]
    async fn test_glob_matches_nested_paths() {
        let dir = fixture();
        let library = library(dir.path(), 100);
        assert_eq!(library.glob_documents("*.txt").await.unwrap(), vec!["guides/setup/install.txt"]);
        assert_eq!(library.glob_documents("*.MD").await.unwrap(), vec!["README.md"]);
        assert!(matches!(
            library.glob_documents("[").await,
            Err(SourceGateError::SearchMode { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_document_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let text: String = (1..=10).map(|i| format!("line {i:02}\n")).collect();
        std::fs::write(dir.path().join("notes.txt"), &text).unwrap();
        let library = library(dir.path(), 8);

        let page = library.read_document("notes.txt", Some(0.5)).await.unwrap();
        assert_eq!(page.total_units, 10);
        assert_eq!(page.unit_index, 6);
        assert_eq!(page.content, "line 06\n");

        let last = library.read_document("notes.txt", Some(15.0)).await.unwrap();
        assert_eq!(last.unit_index, 10);
        let first = library.read_document("notes.txt", None).await.unwrap();
        assert_eq!(first.to_string(), "Section 1 of 10");
    }

    #[tokio::test]
    async fn test_empty_document_has_no_units() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.md"), "").unwrap();
        let page = library(dir.path(), 8).read_document("empty.md", Some(0.3)).await.unwrap();
        assert_eq!(page.total_units, 0);
        assert!(page.content.is_empty());
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_rejected() {
        let dir = fixture();
        let library = library(&dir.path().join("guides"), 100);
        for path in ["../README.md", "/etc/passwd"] {
            let err = library.read_document(path, None).await.unwrap_err();
            assert!(matches!(err, SourceGateError::Document { .. }), "{path}");
            assert!(err.to_string().contains("outside the library root"));
        }
    }

    #[tokio::test]
    async fn test_unsupported_extension_names_the_type() {
        let dir = fixture();
        let err = library(dir.path(), 100)
            .read_document("guides/report.pdf", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".pdf"));
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let dir = fixture();
        let err = library(dir.path(), 100).read_document("missing.txt", None).await.unwrap_err();
        assert!(matches!(err, SourceGateError::NotFound { .. }));
    }

    fn capped_library(dir: &Path, limit: usize) -> LibraryDatasource {
        let url = ConnectionUrl::new(url::Url::from_directory_path(dir).unwrap().to_string());
        let config = SessionConfig {
            library_walk_limit: limit,
            ..SessionConfig::default()
        };
        LibraryDatasource::with_reader(&url, Arc::new(config), Arc::new(TextReader)).unwrap()
    }

    #[tokio::test]
    async fn test_walk_over_the_cap_fails_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("doc{i}.txt")), "x").unwrap();
        }

        let err = capped_library(dir.path(), 3).documents().await.unwrap_err();
        assert!(matches!(err, SourceGateError::Document { .. }));
        assert!(err.to_string().contains("more than 3 documents"));

        assert_eq!(capped_library(dir.path(), 5).documents().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_empty_document_is_a_zero_unit_page_for_any_pagination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blank.txt"), "").unwrap();
        let library = library(dir.path(), 8);
        for p in [0.0, 0.99, 1.0, 42.0, -3.0] {
            let page = library.read_document("blank.txt", Some(p)).await.unwrap();
            assert_eq!((page.unit_index, page.total_units), (0, 0), "{p}");
        }

        std::fs::write(dir.path().join("short.txt"), "abc").unwrap();
        let page = library.read_document("short.txt", Some(42.0)).await.unwrap();
        assert_eq!((page.unit_index, page.total_units), (1, 1));
    }
}
