//! Transcript timestamp formatting and parsing.
//!
//! All transcript metadata carries wall-clock stamps in the form
//! `YYYY/MM/DD HH:MM:SS TZ` (e.g. `2024/01/15 14:30:00 EST`). The query
//! tool treats the trailing timezone token as opaque and compares stamps
//! as naive local date-times.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;

/// strftime layout of the date-time portion of a stamp.
pub const STAMP_LAYOUT: &str = "%Y/%m/%d %H:%M:%S";

/// The machine-local timezone, resolved once. Falls back to UTC when the
/// IANA name cannot be determined or is unknown to chrono-tz.
static LOCAL_TZ: Lazy<Tz> = Lazy::new(|| {
    iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| name.parse().ok())
        .unwrap_or(Tz::UTC)
});

/// Format a moment as a transcript stamp in the local timezone.
pub fn format_stamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&*LOCAL_TZ)
        .format("%Y/%m/%d %H:%M:%S %Z")
        .to_string()
}

/// The current time as a transcript stamp.
pub fn now_stamp() -> String {
    format_stamp(Utc::now())
}

/// The current local wall-clock time as a naive date-time, for comparing
/// against stamps parsed out of transcripts.
pub fn now_naive() -> NaiveDateTime {
    Utc::now().with_timezone(&*LOCAL_TZ).naive_local()
}

/// Parse the date-time portion of a stamp, ignoring any trailing timezone
/// token. Returns `None` when the text does not start with a full stamp.
pub fn parse_stamp(text: &str) -> Option<NaiveDateTime> {
    let datetime = text.get(..19)?;
    NaiveDateTime::parse_from_str(datetime, STAMP_LAYOUT).ok()
}
