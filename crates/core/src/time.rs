//! Wire timestamps.
//!
//! Every timestamp crossing a boundary is UTC with second precision and is
//! rendered as `YYYY-MM-DD HH:MM:SS`. Certificates sign that exact text, so
//! values are truncated to whole seconds before they are stored or signed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};

/// `strftime` layout shared by certificates, stores and the CLI.
pub const WIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current UTC time truncated to whole seconds.
pub fn now_utc() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Drop sub-second precision.
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Render a timestamp in the wire layout.
pub fn format_wire(ts: &DateTime<Utc>) -> String {
    ts.format(WIRE_FORMAT).to_string()
}

/// Parse a wire timestamp. Returns `None` for anything that is not exactly
/// `YYYY-MM-DD HH:MM:SS`.
pub fn parse_wire(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, WIRE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Calendar day (UTC) a timestamp falls on.
pub fn day_of(ts: &DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}
