pub mod admin;
pub mod ai;
pub mod feedback;
pub mod opinions;
pub mod reports;
pub mod stats;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};

/// Parse a `YYYY-MM-DD` (or full `YYYY-MM-DD HH:MM:SS`) bound in the
/// server's local zone. `end` selects the end-of-day expansion for bare
/// dates.
pub fn parse_date_bound(raw: &str, end: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Local
            .from_local_datetime(&dt)
            .single()
            .map(|t| t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = if end {
        date.and_hms_opt(23, 59, 59)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Local
        .from_local_datetime(&time)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

/// Local-zone display format used across the JSON surface.
pub fn format_local(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_date_expands_to_day_bounds() {
        let start = parse_date_bound("2026-03-01", false).unwrap();
        let end = parse_date_bound("2026-03-01", true).unwrap();
        assert!(end > start);
        assert_eq!((end - start).num_seconds(), 86_399);
    }

    #[test]
    fn full_datetime_parses() {
        assert!(parse_date_bound("2026-03-01 12:30:00", false).is_some());
    }

    #[test]
    fn garbage_returns_none() {
        assert!(parse_date_bound("not-a-date", false).is_none());
        assert!(parse_date_bound("", false).is_none());
    }
}
