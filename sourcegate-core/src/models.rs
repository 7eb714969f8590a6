//! Data types shared across datasources.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The three kinds of source a URL can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    /// SQL or warehouse database
    Database,
    /// HTTP API described by an OpenAPI or Swagger document
    Api,
    /// Directory of documents
    Library,
}

impl std::fmt::Display for DatasourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Api => write!(f, "api"),
            Self::Library => write!(f, "library"),
        }
    }
}

/// Tabular result of a query, sample or inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Row values in column order
    pub rows: Vec<Vec<JsonValue>>,
    /// Set when rows were dropped to honour the row limit
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl QueryResult {
    /// Creates a result from columns and rows.
    pub const fn new(columns: Vec<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        Self {
            columns,
            rows,
            truncated: false,
        }
    }

    /// Drops rows beyond `max_rows`, recording that truncation happened.
    #[must_use]
    pub fn truncate(mut self, max_rows: usize) -> Self {
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.truncated = true;
        }
        self
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the result holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Joins the string cells of each row with `.`.
    ///
    /// Used to turn table listings (schema, name) or (catalog, schema, name)
    /// into qualified names. Non-string cells are ignored.
    pub fn qualified_names(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| {
                let parts: Vec<&str> = row
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .filter(|part| !part.is_empty())
                    .collect();
                (!parts.is_empty()).then(|| parts.join("."))
            })
            .collect()
    }
}

/// One pagination unit of a document or result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Text of the selected unit
    pub content: String,
    /// 1-based index of the selected unit
    pub unit_index: usize,
    /// Total number of units
    pub total_units: usize,
}

impl std::fmt::Display for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Section {} of {}", self.unit_index, self.total_units)
    }
}

/// Response of an API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Parsed JSON body, or the raw text wrapped in a JSON string
    pub body: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_sets_flag_only_when_rows_dropped() {
        let rows = (0..5).map(|i| vec![json!(i)]).collect();
        let result = QueryResult::new(vec!["n".into()], rows);

        let kept = result.clone().truncate(5);
        assert!(!kept.truncated);
        assert_eq!(kept.len(), 5);

        let cut = result.truncate(2);
        assert!(cut.truncated);
        assert_eq!(cut.rows, vec![vec![json!(0)], vec![json!(1)]]);
    }

    #[test]
    fn test_qualified_names_skip_non_string_cells() {
        let result = QueryResult::new(
            vec!["database".into(), "tableName".into(), "isTemporary".into()],
            vec![
                vec![json!("sales"), json!("orders"), json!(false)],
                vec![json!(""), json!("tmp_view"), json!(true)],
                vec![JsonValue::Null],
            ],
        );
        assert_eq!(result.qualified_names(), vec!["sales.orders", "tmp_view"]);
    }

    #[test]
    fn test_page_serializes_camel_case() {
        let page = Page {
            content: "hello".into(),
            unit_index: 6,
            total_units: 10,
        };
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["unitIndex"], 6);
        assert_eq!(value["totalUnits"], 10);
        assert_eq!(page.to_string(), "Section 6 of 10");
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_value(DatasourceKind::Api).unwrap(), json!("api"));
        assert_eq!(DatasourceKind::Library.to_string(), "library");
    }
}
