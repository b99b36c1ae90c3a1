use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};

/// Cursor used when nothing has been pulled yet; older than any real record.
pub const EPOCH_CURSOR: &str = "2000-01-01T00:00:00";

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse an ISO-8601 timestamp. Values without an offset are read as UTC.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(ts, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Local mutation stamp, millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Stamp for a mutation of a record last stamped `previous`.
///
/// Never returns a value earlier than `previous`, even when the wall clock
/// went backwards since the last edit.
pub fn next_updated_at(previous: &str) -> String {
    let now = Utc::now();
    match parse_timestamp(previous) {
        Some(prev) if prev >= now => (prev + Duration::milliseconds(1))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        _ => now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Fixed-width UTC form with microseconds. Strings in this form sort the
/// same way as the instants they encode.
pub fn format_stamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
