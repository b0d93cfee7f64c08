use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

/// Format used for the `timestamp >= "..."` clause of the log filter.
/// Fractional seconds are printed only when present.
pub const FILTER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Handles parsing the scan start timestamp from the formats accepted in config and on the CLI
pub struct TimestampParser;

impl TimestampParser {
    /// Parse a timestamp string into a DateTime<Utc>
    /// Accepts RFC 3339, naive date-times (taken as UTC) and bare dates (midnight UTC)
    pub fn parse(timestamp_str: &str) -> Result<DateTime<Utc>> {
        let timestamp = timestamp_str.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(timestamp) {
            return Ok(dt.with_timezone(&Utc));
        }

        if let Ok(naive) = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }

        if let Ok(date) = NaiveDate::parse_from_str(timestamp, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(midnight.and_utc());
            }
        }

        anyhow::bail!("Failed to parse timestamp: {}", timestamp_str)
    }

    /// 00:00:00Z of the day before `now`
    pub fn start_of_yesterday(now: DateTime<Utc>) -> DateTime<Utc> {
        let yesterday = now.date_naive() - Duration::days(1);
        yesterday
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now)
    }

    /// Render a timestamp the way the log filter expects it
    pub fn format_for_filter(timestamp: &DateTime<Utc>) -> String {
        timestamp.format(FILTER_TIMESTAMP_FORMAT).to_string()
    }
}
