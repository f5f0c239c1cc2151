//! # Date Normalization
//!
//! Every persisted record carries a canonical fixed-width UTC timestamp so
//! that lexicographic order over sort keys equals chronological order. The
//! month bucket is recomputed from the canonical instant under the record
//! store's +9h display offset.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Canonical timestamp layout: fixed-length fractional seconds, always UTC.
const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Seconds east of UTC for month bucketing
const MONTH_OFFSET_SECS: i32 = 9 * 3600;

/// Normalize a date value to the canonical UTC form. Accepts a date-only
/// string, a full timestamp, epoch seconds or milliseconds, or a
/// space-separated `YYYY-MM-DD HH:MM:SS` fallback.
pub fn normalize_timestamp(value: &Value) -> Result<String> {
    let instant = match value {
        Value::String(s) => parse_string(s.trim()),
        Value::Number(n) => n.as_i64().and_then(parse_epoch),
        _ => None,
    };
    instant
        .map(|dt| dt.format(CANONICAL_FORMAT).to_string())
        .ok_or_else(|| PipelineError::invalid_date(value.to_string()))
}

/// Convenience wrapper for string inputs.
pub fn normalize_timestamp_str(value: &str) -> Result<String> {
    normalize_timestamp(&Value::String(value.to_string()))
}

/// `YYYY-MM` bucket of a canonical timestamp, computed under the +9h
/// display offset.
pub fn month_bucket(canonical: &str) -> Result<String> {
    let parsed = DateTime::parse_from_rfc3339(canonical)
        .map_err(|_| PipelineError::invalid_date(canonical))?;
    let offset =
        FixedOffset::east_opt(MONTH_OFFSET_SECS).expect("constant offset is in range");
    Ok(parsed.with_timezone(&offset).format("%Y-%m").to_string())
}

fn parse_string(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    // Numeric string: epoch seconds or millis
    if let Ok(epoch) = s.parse::<i64>() {
        return parse_epoch(epoch);
    }
    // Full timestamp with offset
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Date-only
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    // Space-separated fallback
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

fn parse_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    // 1e11 seconds is year 5138; anything larger is milliseconds
    if epoch.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_only_normalizes_to_midnight() {
        assert_eq!(
            normalize_timestamp_str("2024-01-15").unwrap(),
            "2024-01-15T00:00:00.000Z"
        );
    }

    #[test]
    fn test_full_timestamp_canonicalized() {
        assert_eq!(
            normalize_timestamp_str("2024-01-15T09:30:00+09:00").unwrap(),
            "2024-01-15T00:30:00.000Z"
        );
        assert_eq!(
            normalize_timestamp_str("2024-01-15T00:30:00.5Z").unwrap(),
            "2024-01-15T00:30:00.500Z"
        );
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        assert_eq!(
            normalize_timestamp(&json!(1705276800)).unwrap(),
            "2024-01-15T00:00:00.000Z"
        );
        assert_eq!(
            normalize_timestamp(&json!(1705276800123i64)).unwrap(),
            "2024-01-15T00:00:00.123Z"
        );
        // Numeric strings are accepted too
        assert_eq!(
            normalize_timestamp_str("1705276800").unwrap(),
            "2024-01-15T00:00:00.000Z"
        );
    }

    #[test]
    fn test_space_separated_fallback() {
        assert_eq!(
            normalize_timestamp_str("2024-01-15 13:45:00").unwrap(),
            "2024-01-15T13:45:00.000Z"
        );
    }

    #[test]
    fn test_unparseable_is_invalid_date() {
        assert!(matches!(
            normalize_timestamp_str("first of never"),
            Err(PipelineError::InvalidDate { .. })
        ));
        assert!(normalize_timestamp(&json!({"not": "a date"})).is_err());
    }

    #[test]
    fn test_month_bucket_offset() {
        // 16:00Z on Jan 31 is already February at +9h
        assert_eq!(month_bucket("2024-01-31T16:00:00.000Z").unwrap(), "2024-02");
        assert_eq!(month_bucket("2024-01-15T00:00:00.000Z").unwrap(), "2024-01");
        assert_eq!(month_bucket("2023-12-31T15:00:00.000Z").unwrap(), "2024-01");
    }

    #[test]
    fn test_lexicographic_order_is_chronological() {
        let a = normalize_timestamp_str("2024-01-15T00:00:00.050Z").unwrap();
        let b = normalize_timestamp_str("2024-01-15T00:00:00.500Z").unwrap();
        let c = normalize_timestamp_str("2024-02-01").unwrap();
        assert!(a < b && b < c);
    }
}
