//! Row types and column codecs for the SQLite schema in migrations.rs.
//!
//! Ids are stored as hyphenated UUID text and timestamps as fixed-width
//! RFC 3339 UTC text with microsecond precision, so that lexicographic
//! order in SQL equals chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// User record in the users table
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp column, reporting the column index on failure.
pub fn decode_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Decode a UUID column, reporting the column index on failure.
pub fn decode_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Read a UUID column from a row.
pub fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    decode_uuid(idx, &raw)
}

/// Read a timestamp column from a row.
pub fn timestamp_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_timestamp(idx, &raw)
}
