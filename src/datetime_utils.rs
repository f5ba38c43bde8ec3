use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Offset, Utc};

/// Common date/time formats used throughout the application
pub mod formats {
    /// Timestamp format used by the legacy timeline payload:
    /// "Wed Oct 10 20:19:24 +0000 2018"
    pub const TWITTER_LEGACY: &str = "%a %b %d %H:%M:%S %z %Y";

    /// Minute-resolution format for notifications: "2024-01-20 15:30"
    pub const DISPLAY_MINUTES: &str = "%Y-%m-%d %H:%M";
}

/// Parse an RFC3339/ISO 8601 datetime string
pub fn parse_rfc3339(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse RFC3339 date: {date_str}"))
}

/// Parse a timestamp as produced by any of the sources.
///
/// Accepts the legacy timeline format, RFC 2822 (feeds) and RFC 3339.
pub fn parse_source_timestamp(date_str: &str) -> Result<DateTime<Utc>> {
    let trimmed = date_str.trim();
    DateTime::parse_from_str(trimmed, formats::TWITTER_LEGACY)
        .or_else(|_| DateTime::parse_from_rfc2822(trimmed))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| parse_rfc3339(trimmed))
        .with_context(|| format!("Unrecognized timestamp: {date_str}"))
}

/// Build a fixed offset from whole hours, falling back to UTC when out of range
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

/// Format a UTC datetime in the given offset: "2024-01-20 23:30 (UTC+08:00)"
pub fn format_with_offset(datetime: &DateTime<Utc>, utc_offset_hours: i32) -> String {
    let offset = offset_from_hours(utc_offset_hours);
    let local = datetime.with_timezone(&offset);
    format!(
        "{time} (UTC{offset})",
        time = local.format(formats::DISPLAY_MINUTES),
        offset = offset
    )
}

/// Render a source timestamp for display, keeping the raw text if it cannot be parsed
pub fn display_source_timestamp(date_str: &str, utc_offset_hours: i32) -> String {
    match parse_source_timestamp(date_str) {
        Ok(parsed) => format_with_offset(&parsed, utc_offset_hours),
        Err(_) => date_str.trim().to_string(),
    }
}

/// Get current UTC timestamp
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
