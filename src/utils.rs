/// Utility functions for timestamps and value formatting
use time::macros::format_description;
use time::OffsetDateTime;

/// Current wall-clock time in the local offset, UTC if the offset is unknown
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Format a timestamp for the durable log
///
/// Produces `YYYY-MM-DD HH:MM:SS.ffffff`. Falls back to the default string
/// representation if formatting fails.
pub fn format_timestamp(dt: &OffsetDateTime) -> String {
    let format = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
    );
    dt.format(format).unwrap_or_else(|_| dt.to_string())
}

/// Render a reading so that whole numbers keep their decimal point (`10.0`, not `10`)
pub fn format_reading(value: f64) -> String {
    format!("{:?}", value)
}
