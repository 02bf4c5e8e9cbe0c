use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};

/// Current wall-clock time as a unix timestamp in seconds.
pub fn now_secs() -> i64 {
    Local::now().timestamp()
}

pub fn local(ts: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(ts, 0).single()
}

/// Local calendar day containing `ts`.
pub fn local_date(ts: i64) -> NaiveDate {
    local(ts)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Converts a local wall-clock time to a timestamp. Times skipped by a DST
/// transition resolve to `None`; ambiguous ones take the earlier instant.
pub fn timestamp_of(naive: NaiveDateTime) -> Option<i64> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Returns `true` if `fmt` is a strftime pattern chrono can render.
pub fn is_valid_format(fmt: &str) -> bool {
    !StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error))
}

/// Formats `ts` in local time. An unrenderable pattern yields an empty string
/// rather than a panic.
pub fn format_local(ts: i64, fmt: &str) -> String {
    let Some(dt) = local(ts) else {
        return String::new();
    };
    let mut out = String::new();
    if write!(out, "{}", dt.format_with_items(StrftimeItems::new(fmt))).is_err() {
        out.clear();
    }
    out
}
