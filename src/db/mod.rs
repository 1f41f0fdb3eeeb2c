pub mod sqlite;
pub mod repository;

pub use sqlite::*;
pub use repository::*;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Storage format for every timestamp column. Lexicographic order == time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Stored JSON is malformed in {column}: {reason}")]
    MalformedJson { column: String, reason: String },
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, DatabaseError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp '{raw}': {e}")))
}

pub fn parse_uuid(raw: &str) -> Result<uuid::Uuid, DatabaseError> {
    uuid::Uuid::parse_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

/// Map `QueryReturnedNoRows` to `Ok(None)`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>, DatabaseError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    #[test]
    fn timestamp_round_trips_at_second_precision() {
        let ts = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_milli_opt(9, 30, 15, 250)
            .unwrap();
        let stored = format_timestamp(&ts);
        assert_eq!(stored, "2026-03-02 09:30:15");
        let parsed = parse_timestamp(&stored).unwrap();
        assert_eq!(parsed, ts.with_nanosecond(0).unwrap());
    }

    #[test]
    fn parse_accepts_fractional_seconds() {
        assert!(parse_timestamp("2026-03-02 09:30:15.123").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
