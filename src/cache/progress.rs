//! Query identity and per-query fetch progress.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;

use super::CacheError;

/// Hex characters of the SHA-256 digest kept in a query id.
const QUERY_ID_LEN: usize = 32;

/// Deterministic id for a (source, query, date range) combination.
///
/// The id is the first 32 hex characters of
/// `sha256("{source}|{query}|{start}|{end}")`, dates rendered `YYYY-MM-DD` or
/// left empty.
#[must_use]
pub fn query_id(
    source: &str,
    query: &str,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> String {
    let key = format!(
        "{source}|{query}|{}|{}",
        format_date(start_date),
        format_date(end_date)
    );
    let digest = Sha256::digest(key.as_bytes());
    let mut id = hex_encode(&digest);
    id.truncate(QUERY_ID_LEN);
    id
}

pub(crate) fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

/// Durable fetch progress of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryProgress {
    /// Deterministic query id (see [`query_id`]).
    pub query_id: String,
    /// Source name.
    pub source: String,
    /// Query text.
    pub query_text: String,
    /// Inclusive lower date bound.
    pub start_date: Option<NaiveDate>,
    /// Inclusive upper date bound.
    pub end_date: Option<NaiveDate>,
    /// When the query was first registered.
    pub created_at: DateTime<Utc>,
    /// Whether the source stream was fully drained.
    pub completed: bool,
    /// Offset to resume from.
    pub last_offset: u64,
    /// Cursor to resume from.
    pub last_cursor: Option<String>,
    /// Pages checkpointed so far.
    pub total_pages: u64,
    /// Distinct records cached so far.
    pub total_records: u64,
}

impl QueryProgress {
    /// Returns true if the query has a partial checkpoint to resume from.
    #[must_use]
    pub fn has_checkpoint(&self) -> bool {
        !self.completed && (self.last_offset > 0 || self.last_cursor.is_some())
    }
}

/// Raw `queries` row.
#[derive(Debug, FromRow)]
pub(crate) struct QueryRow {
    pub query_id: String,
    pub source: String,
    pub query_text: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub created_at: String,
    pub completed: bool,
    pub last_offset: i64,
    pub last_cursor: Option<String>,
    pub total_pages: i64,
    pub total_records: i64,
}

impl TryFrom<QueryRow> for QueryProgress {
    type Error = CacheError;

    fn try_from(row: QueryRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| CacheError::Corrupt {
            query_id: row.query_id.clone(),
            reason,
        };
        let parse_date = |value: Option<&str>| -> Result<Option<NaiveDate>, CacheError> {
            value
                .filter(|v| !v.is_empty())
                .map(|v| {
                    NaiveDate::parse_from_str(v, "%Y-%m-%d")
                        .map_err(|e| corrupt(format!("bad date '{v}': {e}")))
                })
                .transpose()
        };
        let non_negative = |field: &str, value: i64| {
            u64::try_from(value).map_err(|_| corrupt(format!("negative {field}: {value}")))
        };

        let start_date = parse_date(row.start_date.as_deref())?;
        let end_date = parse_date(row.end_date.as_deref())?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| corrupt(format!("bad created_at '{}': {e}", row.created_at)))?
            .with_timezone(&Utc);
        let last_offset = non_negative("last_offset", row.last_offset)?;
        let total_pages = non_negative("total_pages", row.total_pages)?;
        let total_records = non_negative("total_records", row.total_records)?;

        Ok(Self {
            query_id: row.query_id,
            source: row.source,
            query_text: row.query_text,
            start_date,
            end_date,
            created_at,
            completed: row.completed,
            last_offset,
            last_cursor: row.last_cursor,
            total_pages,
            total_records,
        })
    }
}
