//! Timestamp utilities
//!
//! All timestamps in Chorus are UTC. The document store persists them as
//! fixed-width RFC3339 text so that range predicates on TEXT columns order
//! correctly.

use chrono::{DateTime, Duration, NaiveTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Clamp a timestamp to 00:00:00 UTC on its own day
pub fn start_of_utc_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Clamp a timestamp to 23:59:59 UTC on its own day
pub fn end_of_utc_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    start_of_utc_day(dt) + Duration::seconds(86_399)
}

/// Serialize a timestamp for a TEXT column (RFC3339, microseconds, Z suffix)
pub fn to_db(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written by [`to_db`]
pub fn from_db(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("malformed timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
    }

    #[test]
    fn test_day_clamping() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 7, 13, 45, 12).unwrap();
        let start = start_of_utc_day(dt);
        let end = end_of_utc_day(dt);

        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 59).unwrap());
    }

    #[test]
    fn test_db_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 2, 8, 30, 0).unwrap();
        let text = to_db(dt);
        assert_eq!(from_db(&text).unwrap(), dt);
    }

    #[test]
    fn test_db_text_orders_lexicographically() {
        let earlier = to_db(Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap());
        let later = to_db(Utc.with_ymd_and_hms(2024, 1, 10, 23, 59, 59).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn test_from_db_rejects_garbage() {
        assert!(from_db("not-a-timestamp").is_err());
    }
}
