
use chrono::Duration;


/// This is the standard way of printing a duration in tabtally.
pub fn format_duration(v: Duration) -> String {
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}

/// Converts tracked fractional seconds into a printable duration. Sub-second precision is
/// dropped, totals are shown with second granularity.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::seconds(seconds as i64)
}
