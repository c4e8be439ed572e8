//! Normalized bibliographic records and the events a source stream yields.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A normalized bibliographic record.
///
/// `id` must be stable for a given upstream item; the cache deduplicates on
/// `(query_id, id)`. Source-specific fields that have no normalized slot are
/// kept in `extra` and flattened on serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique identifier within the source.
    pub id: String,
    /// Title of the work.
    pub title: String,
    /// Name of the source that produced the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Author display names, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Publication year.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    /// DOI, without resolver prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    /// Landing page URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Abstract text.
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    /// Everything else the adapter wants to keep.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Creates a record with only the required fields set.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            source: None,
            authors: Vec::new(),
            year: None,
            doi: None,
            url: None,
            abstract_text: None,
            extra: Map::new(),
        }
    }

    /// Sets the originating source name.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the author list.
    #[must_use]
    pub fn with_authors(mut self, authors: Vec<String>) -> Self {
        self.authors = authors;
        self
    }

    /// Sets the publication year.
    #[must_use]
    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Sets the DOI.
    #[must_use]
    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    /// Adds an adapter-specific field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record {{ id: {}, title: {} }}", self.id, self.title)
    }
}

/// Pagination checkpoint reported by an adapter after finishing a page.
///
/// The orchestrator persists these so a later run can hand the adapter a
/// resume point through [`FetchRequest::offset`] / [`FetchRequest::cursor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageCheckpoint {
    /// 1-indexed page number within this query.
    pub page_number: u64,
    /// Raw page payload, if the adapter wants it kept.
    pub raw_response: Option<Value>,
    /// Offset to resume from after this page.
    pub offset: Option<u64>,
    /// Opaque cursor to resume from after this page.
    pub cursor: Option<String>,
}

/// One item of a source stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A normalized record.
    Record(Record),
    /// A page boundary with its resume point.
    Page(PageCheckpoint),
}

/// Parameters for one source stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Free-text query in the source's syntax.
    pub query: String,
    /// Inclusive lower bound on publication date.
    pub start_date: Option<NaiveDate>,
    /// Inclusive upper bound on publication date.
    pub end_date: Option<NaiveDate>,
    /// Stop after this many records.
    pub limit: Option<usize>,
    /// Offset to resume from (0 on a fresh query).
    pub offset: u64,
    /// Cursor to resume from, for cursor-paginated sources.
    pub cursor: Option<String>,
}

impl FetchRequest {
    /// Creates a request for `query` with no bounds and no resume point.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Returns true when the request carries a resume point.
    #[must_use]
    pub fn is_resuming(&self) -> bool {
        self.offset > 0 || self.cursor.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_extra_fields_flat() {
        let record = Record::new("W123", "Graph neural networks")
            .with_year(2021)
            .with_extra("cited_by_count", Value::from(42));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "W123");
        assert_eq!(json["year"], 2021);
        assert_eq!(json["cited_by_count"], 42);
        assert!(json.get("doi").is_none());
    }

    #[test]
    fn test_record_deserializes_unknown_fields_into_extra() {
        let record: Record = serde_json::from_str(
            r#"{"id": "1", "title": "T", "abstract": "A", "venue": "NeurIPS"}"#,
        )
        .unwrap();
        assert_eq!(record.abstract_text.as_deref(), Some("A"));
        assert_eq!(record.extra.get("venue"), Some(&Value::from("NeurIPS")));
    }

    #[test]
    fn test_fetch_request_is_resuming() {
        let mut request = FetchRequest::new("q");
        assert!(!request.is_resuming());
        request.cursor = Some("abc".to_string());
        assert!(request.is_resuming());
    }

    #[test]
    fn test_record_display() {
        let display = Record::new("42", "Title").to_string();
        assert!(display.contains("42"));
        assert!(display.contains("Title"));
    }
}
