//! Time utilities: XMLTV datetime parsing and display/server offset math.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Parse an XMLTV timestamp: `YYYYMMDDHHMMSS ±HHMM`, with the timezone
/// suffix optional. Bare timestamps are taken as UTC, the convention most
/// real feeds without a suffix follow.
pub fn parse_xmltv_datetime(datetime_str: &str) -> Option<DateTime<Utc>> {
    let datetime_str = datetime_str.trim();

    if let Ok(dt) = DateTime::parse_from_str(datetime_str, "%Y%m%d%H%M%S %z") {
        return Some(dt.with_timezone(&Utc));
    }

    // Some feeds write the offset without the separating space.
    if datetime_str.len() > 14 && !datetime_str.contains(' ') {
        let (stamp, offset) = datetime_str.split_at(14);
        let rejoined = format!("{stamp} {offset}");
        if let Ok(dt) = DateTime::parse_from_str(&rejoined, "%Y%m%d%H%M%S %z") {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let bare = datetime_str.split_whitespace().next()?;
    NaiveDateTime::parse_from_str(bare, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// "Now" shifted by the configured display offset.
pub fn adjusted_current_time(offset_hours: i32) -> DateTime<Utc> {
    adjust_time_for_display(Utc::now(), offset_hours)
}

/// Server-time instant -> display instant. Inverse of
/// [`adjust_time_for_server`]; the pair round-trips exactly for
/// integral-hour offsets.
pub fn adjust_time_for_display(time: DateTime<Utc>, offset_hours: i32) -> DateTime<Utc> {
    time + Duration::hours(offset_hours as i64)
}

/// Display instant -> server-time instant.
pub fn adjust_time_for_server(time: DateTime<Utc>, offset_hours: i32) -> DateTime<Utc> {
    time - Duration::hours(offset_hours as i64)
}

/// Format a program's time span for logs and CLI output, e.g. "20:00 - 21:00".
pub fn format_time_range(start: DateTime<Utc>, end: DateTime<Utc>, offset_hours: i32) -> String {
    let start = adjust_time_for_display(start, offset_hours);
    let end = adjust_time_for_display(end, offset_hours);
    format!("{} - {}", start.format("%H:%M"), end.format("%H:%M"))
}
