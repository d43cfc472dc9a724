//! Timestamp helpers shared by the store, the service and the loops.
//!
//! Persisted timestamps are fixed-width RFC 3339 UTC strings with millisecond
//! precision, so string order in SQL matches chronological order.

use chrono::{DateTime, LocalResult, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

pub fn to_db_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_db_timestamp() -> String {
    to_db_timestamp(Utc::now())
}

pub fn parse_db_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Returns the zone when it names a valid IANA timezone, the fallback otherwise.
pub fn normalize_zone(zone: Option<&str>, fallback: &str) -> Tz {
    zone.filter(|value| !value.trim().is_empty())
        .and_then(|value| value.trim().parse::<Tz>().ok())
        .or_else(|| fallback.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

/// Parses an ISO-8601 instant. Values carrying an offset are taken as-is;
/// naive values (`2026-10-19T18:30` or `2026-10-19 18:30:00`) are read as
/// wall-clock time in `zone`.
pub fn parse_in_zone(value: &str, zone: Tz) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())?;
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // Ambiguous wall-clock time during a DST fold: take the earlier instant.
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}
